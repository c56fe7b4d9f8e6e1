//! Narration synthesis boundary.
//!
//! Voice is an external collaborator: the pipeline only needs an audio file
//! with a known duration. [`PiperSynthesizer`] shells out to the Piper TTS
//! binary; any other engine plugs in through [`SpeechSynthesizer`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::VoiceConfig;
use crate::{Error, Result};

/// A synthesized narration track.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub path: PathBuf,
    pub duration_s: f64,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into `output` and report the resulting duration.
    async fn synthesize(&self, text: &str, output: &Path) -> Result<AudioTrack>;
}

/// Piper TTS subprocess wrapper (local, CPU-bound).
pub struct PiperSynthesizer {
    binary: PathBuf,
    model: PathBuf,
    model_config: Option<PathBuf>,
}

impl PiperSynthesizer {
    pub fn new(config: &VoiceConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("voice.model is required for piper synthesis".into()))?;
        Ok(Self {
            binary: config.binary.clone(),
            model,
            model_config: config.model_config.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<AudioTrack> {
        tracing::info!(chars = text.len(), output = %output.display(), "synthesizing narration");

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--model")
            .arg(&self.model)
            .arg("--output_file")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model_config) = &self.model_config {
            command.arg("--config").arg(model_config);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Voice(format!("failed to spawn {}: {e}", self.binary.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| Error::Voice(format!("failed to write text to piper: {e}")))?;
        }

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Voice(format!("failed to wait for piper: {e}")))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::Voice(format!(
                "piper exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        let duration_s = probe_duration(output).await?;
        tracing::info!(duration_s, "narration ready");
        Ok(AudioTrack {
            path: output.to_path_buf(),
            duration_s,
        })
    }
}

/// Measure a media file's duration via ffprobe.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::Voice(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Voice(format!(
            "ffprobe exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|e| Error::Voice(format!("unparseable ffprobe duration '{}': {e}", text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piper_requires_a_model_path() {
        let config = VoiceConfig::default();
        assert!(matches!(
            PiperSynthesizer::new(&config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn probe_duration_reports_missing_tool_or_file_as_voice_error() {
        let result = probe_duration(Path::new("/nonexistent/narration.wav")).await;
        assert!(matches!(result, Err(Error::Voice(_))));
    }
}
