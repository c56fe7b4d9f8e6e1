//! Pipeline configuration.
//!
//! Every tunable the pipeline consumes lives here, with serde defaults so a
//! partial JSON config file only needs to name what it overrides. Validation
//! happens once at startup: a missing backend or tool is a [`Error::Config`]
//! before any scene is processed, never mid-run.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub generation: GenerationConfig,
    /// Remote inference service. `None` means the run is local-only.
    pub remote: Option<RemoteConfig>,
    pub llm: LlmConfig,
    pub enhance: EnhanceConfig,
    pub quality: QualityConfig,
    pub assembly: AssemblyConfig,
    pub voice: VoiceConfig,
    pub scratch: ScratchConfig,
}

/// Output video geometry. Defaults target the 9:16 vertical short format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Hard cap on output length; longer narration is trimmed with a warning.
    pub max_duration_s: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            max_duration_s: 60.0,
        }
    }
}

/// Image generation parameters and the router/resource tunables around them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub sampler: String,
    pub steps: u32,
    /// Hard ceiling on inference steps, enforced by the router regardless of
    /// caller-supplied parameters. Requests above it are clamped, not refused.
    pub step_ceiling: u32,
    pub guidance: f64,
    /// Generation resolution; upscaled to the video resolution afterwards.
    pub width: u32,
    pub height: u32,
    /// Fixed seed for reproducible runs. `None` lets the backend pick.
    pub seed: Option<u64>,
    /// Upper bound on scenes rendered per video.
    pub max_scenes: usize,
    /// Minimum gap between consecutive in-process generations.
    pub quiescence_gap_ms: u64,
    /// Allocated-VRAM ceiling; exceeding it after a reset is fatal for the scene.
    pub vram_ceiling_bytes: u64,
    pub call_timeout_s: u64,
    pub probe_timeout_s: u64,
    /// Feed the previous accepted scene image as a structural guide.
    pub continuity: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sampler: "DPM++ 2M Karras".to_string(),
            steps: 12,
            step_ceiling: 30,
            guidance: 7.5,
            width: 1024,
            height: 1024,
            seed: None,
            max_scenes: 3,
            quiescence_gap_ms: 1000,
            vram_ceiling_bytes: 5 * 1024 * 1024 * 1024, // 5 GiB
            call_timeout_s: 300,
            probe_timeout_s: 5,
            continuity: true,
        }
    }
}

/// Remote inference service endpoint (SD-WebUI wire format).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_s: u64,
    /// ControlNet model used for the continuity guide. `None` disables
    /// guided generation on the remote path.
    pub controlnet_model: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".to_string(),
            timeout_s: 300,
            controlnet_model: None,
        }
    }
}

/// Chat-completion endpoint shared by prompt enhancement and quality
/// evaluation. Any OpenAI-compatible service works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Usually injected from the environment by the caller; an empty key
    /// disables both enhancement and evaluation rather than failing the run.
    pub api_key: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            api_key: String::new(),
            temperature: 0.8,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    pub enabled: bool,
    /// Run the up-front narrative analysis pass and reuse it for every scene.
    pub context_aware: bool,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_aware: true,
        }
    }
}

/// Quality gate tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Accept threshold on the 0–10 scale.
    pub threshold: f64,
    /// Total generate+score attempts per scene, including the first.
    pub max_attempts: u32,
    pub factors: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 7.5,
            max_attempts: 2,
            factors: vec![
                "prompt_match".to_string(),
                "composition".to_string(),
                "vertical_format".to_string(),
                "artifacts".to_string(),
                "narrative_fit".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopRight,
    TopLeft,
    BottomRight,
    BottomLeft,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub text: String,
    pub font_size: u32,
    pub opacity: f64,
    pub position: WatermarkPosition,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            text: "AI Generated".to_string(),
            font_size: 16,
            opacity: 0.5,
            position: WatermarkPosition::TopRight,
        }
    }
}

/// Encoder and overlay settings for the final render.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub ffmpeg_timeout_s: u64,
    /// Render scene images as slow-zoom motion clips instead of stills.
    pub ken_burns: bool,
    pub captions: bool,
    pub words_per_caption: usize,
    pub max_caption_phrases: usize,
    pub caption_font_size: u32,
    pub caption_font_color: String,
    pub caption_border_width: u32,
    pub caption_border_color: String,
    pub watermark: Option<WatermarkConfig>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            ffmpeg_timeout_s: 600,
            ken_burns: true,
            captions: true,
            words_per_caption: 2,
            max_caption_phrases: 20,
            caption_font_size: 52,
            caption_font_color: "white".to_string(),
            caption_border_width: 3,
            caption_border_color: "black".to_string(),
            watermark: Some(WatermarkConfig::default()),
        }
    }
}

/// Speech synthesis (Piper) settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub binary: PathBuf,
    pub model: Option<PathBuf>,
    pub model_config: Option<PathBuf>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("piper"),
            model: None,
            model_config: None,
        }
    }
}

/// Scratch directory lifecycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Defaults to `<data-local-dir>/shortsmith/scratch`.
    pub root: Option<PathBuf>,
    pub max_age_hours: u64,
    pub max_bytes: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_age_hours: 24,
            max_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
        }
    }
}

impl Config {
    /// Load a config overlay from a JSON file.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Sanity-check values that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<()> {
        if self.video.width == 0 || self.video.height == 0 || self.video.fps == 0 {
            return Err(Error::Config(
                "video width/height/fps must be non-zero".into(),
            ));
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            // yuv420p output requires even dimensions.
            return Err(Error::Config("video width/height must be even".into()));
        }
        if self.generation.steps == 0 || self.generation.step_ceiling == 0 {
            return Err(Error::Config("step count and ceiling must be >= 1".into()));
        }
        if self.quality.max_attempts == 0 {
            return Err(Error::Config("quality.max_attempts must be >= 1".into()));
        }
        if !(0.0..=10.0).contains(&self.quality.threshold) {
            return Err(Error::Config(
                "quality.threshold must be within 0..=10".into(),
            ));
        }
        if self.assembly.words_per_caption == 0 {
            return Err(Error::Config("words_per_caption must be >= 1".into()));
        }
        if self.generation.max_scenes == 0 {
            return Err(Error::Config("generation.max_scenes must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.video.width, 1080);
        assert_eq!(config.video.height, 1920);
        assert_eq!(config.quality.threshold, 7.5);
        assert_eq!(config.quality.max_attempts, 2);
        assert_eq!(config.quality.factors.len(), 5);
        assert!(config.remote.is_none());
    }

    #[test]
    fn partial_json_overlay_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"quality": {"threshold": 6.0}, "remote": {"base_url": "http://sd:7860"}}"#,
        )
        .unwrap();
        assert_eq!(config.quality.threshold, 6.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.quality.max_attempts, 2);
        let remote = config.remote.unwrap();
        assert_eq!(remote.base_url, "http://sd:7860");
        assert_eq!(remote.timeout_s, 300);
    }

    #[test]
    fn validation_rejects_odd_dimensions() {
        let mut config = Config::default();
        config.video.width = 1081;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let mut config = Config::default();
        config.quality.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn watermark_position_parses_kebab_case() {
        let wm: WatermarkConfig =
            serde_json::from_str(r#"{"position": "bottom-left"}"#).unwrap();
        assert_eq!(wm.position, WatermarkPosition::BottomLeft);
    }
}
