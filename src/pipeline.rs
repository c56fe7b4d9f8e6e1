//! End-to-end video pipeline.
//!
//! Orchestrates one video:
//!
//! 1. Clean the scratch directory (leftovers from interrupted runs).
//! 2. Fork narration synthesis and start generating scene images; the two
//!    are joined before assembly. Scenes themselves run strictly
//!    sequentially — the in-process backend holds exclusive accelerator
//!    state, and scene N's continuity guide depends on scene N-1's output.
//! 3. Drive each scene through the quality-gated refinement loop.
//! 4. Fit clip durations to the narration, build caption cues, and hand the
//!    plan to the assembler.
//! 5. Clean the scratch directory on success.
//!
//! Scene-level failures abort only that scene's slot; the remaining scenes
//! still run, and the run-level error reports which scenes succeeded.
//! `ResourceExhausted` is retried once per scene after a hard reset, then
//! aborts the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::assemble::{Assembler, AssemblyPlan, VisualClip, ZoomPan};
use crate::backend::{SceneRequest, ScriptContext};
use crate::captions::caption_cues;
use crate::config::Config;
use crate::enhance::{NarrativeStyle, PromptEnhancer};
use crate::quality::QualityEvaluator;
use crate::refine::{Acceptance, RefinementLoop};
use crate::router::BackendRouter;
use crate::scratch::ScratchDir;
use crate::voice::{AudioTrack, SpeechSynthesizer};
use crate::{Error, Result};

/// One scene of the input script.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneSpec {
    pub description: String,
}

/// The script a video is generated from.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoScript {
    pub title: String,
    #[serde(default)]
    pub topic: String,
    pub narration: String,
    pub scenes: Vec<SceneSpec>,
}

/// Per-scene result recorded in the run report.
#[derive(Debug)]
pub struct SceneOutcome {
    pub scene: usize,
    pub backend: &'static str,
    pub score: f64,
    pub attempts: u32,
    pub acceptance: Acceptance,
    pub image: PathBuf,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RunReport {
    pub output: PathBuf,
    pub scenes: Vec<SceneOutcome>,
    pub audio_duration_s: f64,
}

pub struct VideoPipeline {
    config: Config,
    router: BackendRouter,
    enhancer: Arc<dyn PromptEnhancer>,
    evaluator: Arc<dyn QualityEvaluator>,
    voice: Arc<dyn SpeechSynthesizer>,
    assembler: Assembler,
    scratch: ScratchDir,
}

impl VideoPipeline {
    pub fn new(
        config: Config,
        router: BackendRouter,
        enhancer: Arc<dyn PromptEnhancer>,
        evaluator: Arc<dyn QualityEvaluator>,
        voice: Arc<dyn SpeechSynthesizer>,
    ) -> Result<Self> {
        config.validate()?;
        let scratch = ScratchDir::new(config.scratch.root.clone());
        // The age/size cap applies independent of any single run.
        scratch.purge(
            Duration::from_secs(config.scratch.max_age_hours * 3600),
            config.scratch.max_bytes,
        )?;
        let assembler = Assembler::new(&config.video, &config.assembly, scratch.path())?;
        Ok(Self {
            config,
            router,
            enhancer,
            evaluator,
            voice,
            assembler,
            scratch,
        })
    }

    /// Generate one video from `script` into `output`.
    pub async fn run(&mut self, script: &VideoScript, output: &Path) -> Result<RunReport> {
        self.scratch.prepare()?;

        let scene_count = script.scenes.len().min(self.config.generation.max_scenes);
        if scene_count == 0 {
            return Err(Error::Config("script has no scenes".into()));
        }
        if scene_count < script.scenes.len() {
            tracing::info!(
                requested = script.scenes.len(),
                used = scene_count,
                "limiting scene count"
            );
        }

        let context = ScriptContext {
            title: script.title.clone(),
            topic: script.topic.clone(),
            narration: script.narration.clone(),
        };

        // Style analysis is best-effort and shared across all scenes.
        let style = if self.config.enhance.enabled && self.config.enhance.context_aware {
            match self.enhancer.analyze(&context).await {
                Ok(style) => style,
                Err(error) => {
                    tracing::warn!(%error, "narrative analysis failed — using default style");
                    NarrativeStyle::default()
                }
            }
        } else {
            NarrativeStyle::default()
        };

        // Narration synthesis is CPU/network-bound and shares nothing with
        // the accelerator, so it runs concurrently with scene generation
        // and is joined before assembly.
        let narration = script.narration.clone();
        let audio_path = self.scratch.file("narration.wav");
        let voice = Arc::clone(&self.voice);
        let voice_task =
            tokio::spawn(async move { voice.synthesize(&narration, &audio_path).await });

        let mut outcomes: Vec<SceneOutcome> = Vec::new();
        let mut failures: Vec<(usize, String)> = Vec::new();
        let mut guide: Option<PathBuf> = None;

        for (index, scene) in script.scenes.iter().take(scene_count).enumerate() {
            let request = SceneRequest {
                index,
                scene_count,
                description: scene.description.clone(),
                context: Some(context.clone()),
                width: self.config.generation.width,
                height: self.config.generation.height,
            };
            let scene_guide = if self.config.generation.continuity {
                guide.clone()
            } else {
                None
            };

            match self
                .process_scene(&request, &style, scene_guide.as_deref())
                .await
            {
                Ok(outcome) => {
                    guide = Some(outcome.image.clone());
                    outcomes.push(outcome);
                }
                Err(error @ Error::ResourceExhausted { .. }) => {
                    // One hard reset buys one retry; a second exhaustion is
                    // fatal for the whole run.
                    tracing::warn!(scene = index, %error, "hard reset and retrying scene once");
                    self.router.resources().lock().await.reset()?;
                    let outcome = self
                        .process_scene(&request, &style, scene_guide.as_deref())
                        .await?;
                    guide = Some(outcome.image.clone());
                    outcomes.push(outcome);
                }
                Err(error) => {
                    tracing::error!(scene = index, %error, "scene failed");
                    failures.push((index, error.to_string()));
                }
            }
        }

        let audio = voice_task
            .await
            .map_err(|e| Error::Voice(format!("synthesis task panicked: {e}")))??;
        let audio = self.clamp_audio(audio);

        if !failures.is_empty() {
            return Err(Error::SceneFailures {
                failed: failures,
                succeeded: outcomes.iter().map(|o| o.scene).collect(),
            });
        }

        let plan = self.build_plan(&outcomes, audio, script, output);
        self.assembler.build(&plan).await?;

        if let Err(error) = self.scratch.cleanup() {
            tracing::warn!(%error, "scratch cleanup failed");
        }

        Ok(RunReport {
            output: plan.output,
            scenes: outcomes,
            audio_duration_s: plan.audio.duration_s,
        })
    }

    async fn process_scene(
        &mut self,
        request: &SceneRequest,
        style: &NarrativeStyle,
        guide: Option<&Path>,
    ) -> Result<SceneOutcome> {
        let style = self.config.enhance.enabled.then_some(style);
        let mut gate = RefinementLoop::new(
            &mut self.router,
            self.enhancer.as_ref(),
            self.evaluator.as_ref(),
            &self.config.generation,
            &self.config.quality,
        );
        let accepted = gate.run(request, style, guide).await?;

        // Upscale to the output resolution before the image reaches a clip.
        let video = &self.config.video;
        let image = if (request.width, request.height) != (video.width, video.height) {
            image::imageops::resize(
                &accepted.image.image,
                video.width,
                video.height,
                image::imageops::FilterType::Lanczos3,
            )
        } else {
            accepted.image.image.clone()
        };
        let path = self.scratch.file(&format!("scene_{}.png", request.index));
        image.save(&path)?;

        Ok(SceneOutcome {
            scene: request.index,
            backend: accepted.image.backend,
            score: accepted.score,
            attempts: accepted.attempts,
            acceptance: accepted.acceptance,
            image: path,
            elapsed: accepted.image.elapsed,
        })
    }

    fn clamp_audio(&self, audio: AudioTrack) -> AudioTrack {
        let max = self.config.video.max_duration_s;
        if audio.duration_s > max {
            tracing::warn!(
                duration_s = audio.duration_s,
                max_s = max,
                "narration exceeds the maximum video length — trimming"
            );
            AudioTrack {
                duration_s: max,
                ..audio
            }
        } else {
            audio
        }
    }

    fn build_plan(
        &self,
        outcomes: &[SceneOutcome],
        audio: AudioTrack,
        script: &VideoScript,
        output: &Path,
    ) -> AssemblyPlan {
        let per_clip = audio.duration_s / outcomes.len() as f64;
        let clips = outcomes
            .iter()
            .map(|outcome| {
                if self.config.assembly.ken_burns {
                    VisualClip::Motion {
                        image: outcome.image.clone(),
                        duration: per_clip,
                        zoom: ZoomPan::default(),
                    }
                } else {
                    VisualClip::Static {
                        image: outcome.image.clone(),
                        duration: per_clip,
                    }
                }
            })
            .collect();

        let captions = if self.config.assembly.captions {
            caption_cues(
                &script.narration,
                audio.duration_s,
                self.config.assembly.words_per_caption,
                self.config.assembly.max_caption_phrases,
            )
        } else {
            Vec::new()
        };

        let mut plan = AssemblyPlan {
            clips,
            audio,
            captions,
            output: output.to_path_buf(),
        };
        plan.fit_to_audio();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_script_parses_with_optional_topic() {
        let script: VideoScript = serde_json::from_str(
            r#"{"title": "Ocean Facts", "narration": "The ocean is deep.",
                "scenes": [{"description": "waves at dawn"}]}"#,
        )
        .unwrap();
        assert_eq!(script.title, "Ocean Facts");
        assert_eq!(script.topic, "");
        assert_eq!(script.scenes.len(), 1);
    }
}
