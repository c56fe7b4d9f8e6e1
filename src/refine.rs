//! Quality-gated refinement loop.
//!
//! One scene moves through an explicit state machine:
//!
//! ```text
//! Drafting → Generated → Scored → Accepted
//!                ▲                    │ (below threshold, attempts left)
//!                └──── Drafting ◄─────┘
//! ```
//!
//! Terminal states are `Accepted` (score met the threshold) and
//! `AcceptedBest` (attempts exhausted — the best-scoring attempt wins, which
//! is not necessarily the last one). The loop is bounded: it makes at most
//! `max_attempts` generation calls per scene and always terminates through
//! one of the two accept exits. Exhausting the gate is not an error.

use std::path::Path;

use crate::backend::{GeneratedImage, GenerationParams, SceneRequest};
use crate::config::{GenerationConfig, QualityConfig};
use crate::enhance::{fallback_enhancement, NarrativeStyle, PromptEnhancer};
use crate::quality::{QualityEvaluator, QualityScore};
use crate::router::BackendRouter;
use crate::Result;

/// How a scene exited the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Score met the configured threshold.
    Threshold,
    /// Attempts exhausted; best-scoring attempt accepted.
    Best,
}

/// One scene's accepted result.
#[derive(Debug)]
pub struct AcceptedScene {
    pub image: GeneratedImage,
    pub score: f64,
    pub attempts: u32,
    pub acceptance: Acceptance,
}

enum Phase {
    Drafting { suggestion: Option<String> },
    Generated(GeneratedImage),
    Scored(GeneratedImage, QualityScore),
}

pub struct RefinementLoop<'a> {
    router: &'a mut BackendRouter,
    enhancer: &'a dyn PromptEnhancer,
    evaluator: &'a dyn QualityEvaluator,
    generation: &'a GenerationConfig,
    threshold: f64,
    max_attempts: u32,
}

impl<'a> RefinementLoop<'a> {
    pub fn new(
        router: &'a mut BackendRouter,
        enhancer: &'a dyn PromptEnhancer,
        evaluator: &'a dyn QualityEvaluator,
        generation: &'a GenerationConfig,
        quality: &QualityConfig,
    ) -> Self {
        Self {
            router,
            enhancer,
            evaluator,
            generation,
            threshold: quality.threshold,
            max_attempts: quality.max_attempts.max(1),
        }
    }

    /// Run one scene to acceptance.
    pub async fn run(
        &mut self,
        request: &SceneRequest,
        style: Option<&NarrativeStyle>,
        guide: Option<&Path>,
    ) -> Result<AcceptedScene> {
        let mut attempts = 0u32;
        let mut best: Option<(GeneratedImage, f64)> = None;
        let mut phase = Phase::Drafting { suggestion: None };

        loop {
            phase = match phase {
                Phase::Drafting { suggestion } => {
                    let enhanced = match self
                        .enhancer
                        .enhance(request, style, suggestion.as_deref())
                        .await
                    {
                        Ok(enhanced) => enhanced,
                        Err(error) => {
                            tracing::warn!(scene = request.index, %error, "prompt enhancement failed — using raw description");
                            fallback_enhancement(&request.description)
                        }
                    };
                    let params = GenerationParams {
                        prompt: enhanced.prompt,
                        negative_prompt: enhanced.negative_prompt,
                        sampler: self.generation.sampler.clone(),
                        steps: self.generation.steps,
                        guidance: self.generation.guidance,
                        seed: self.generation.seed,
                        guide: guide.map(Path::to_path_buf),
                    };
                    attempts += 1;
                    tracing::info!(
                        scene = request.index,
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        "generating"
                    );
                    let image = self.router.generate(request, &params).await?;
                    Phase::Generated(image)
                }

                Phase::Generated(image) => {
                    let score = match self.evaluator.score(&image, request).await {
                        Ok(score) => score,
                        Err(error) => {
                            tracing::warn!(scene = request.index, %error, "quality evaluation failed — auto-accepting");
                            QualityScore::auto_accept(self.threshold)
                        }
                    };
                    Phase::Scored(image, score)
                }

                Phase::Scored(image, score) => {
                    let overall = score.overall;
                    if overall >= self.threshold {
                        tracing::info!(
                            scene = request.index,
                            score = overall,
                            threshold = self.threshold,
                            attempts,
                            "scene image meets quality threshold"
                        );
                        return Ok(AcceptedScene {
                            image,
                            score: overall,
                            attempts,
                            acceptance: Acceptance::Threshold,
                        });
                    }

                    tracing::warn!(
                        scene = request.index,
                        score = overall,
                        threshold = self.threshold,
                        "scene image below quality threshold"
                    );

                    if best.as_ref().map_or(true, |(_, b)| overall > *b) {
                        best = Some((image, overall));
                    }

                    if attempts >= self.max_attempts {
                        if let Some((image, best_score)) = best.take() {
                            tracing::warn!(
                                scene = request.index,
                                attempts,
                                best_score,
                                "refinement attempts exhausted — accepting best attempt"
                            );
                            return Ok(AcceptedScene {
                                image,
                                score: best_score,
                                attempts,
                                acceptance: Acceptance::Best,
                            });
                        }
                    }

                    let suggestion = score.suggestion.unwrap_or_else(|| {
                        "improve prompt fidelity, composition and vertical framing".to_string()
                    });
                    Phase::Drafting {
                        suggestion: Some(suggestion),
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImageBackend, ScriptContext};
    use crate::enhance::{EnhancedPrompt, StaticEnhancer};
    use crate::resource::ResourceManager;
    use async_trait::async_trait;
    use candle_core::Device;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Mutex;

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageBackend for Arc<CountingBackend> {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }

        async fn generate(
            &self,
            _request: &SceneRequest,
            _params: &GenerationParams,
        ) -> Result<RgbImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // Encode the attempt number in the pixel data so tests can tell
            // which attempt's image was accepted.
            Ok(RgbImage::from_pixel(2, 2, image::Rgb([call as u8, 0, 0])))
        }
    }

    /// Evaluator that replays a scripted score sequence.
    struct ScriptedEvaluator {
        scores: StdMutex<Vec<f64>>,
    }

    impl ScriptedEvaluator {
        fn new(scores: &[f64]) -> Self {
            let mut reversed: Vec<f64> = scores.to_vec();
            reversed.reverse();
            Self {
                scores: StdMutex::new(reversed),
            }
        }
    }

    #[async_trait]
    impl QualityEvaluator for ScriptedEvaluator {
        async fn score(
            &self,
            _image: &GeneratedImage,
            _request: &SceneRequest,
        ) -> Result<QualityScore> {
            let overall = self.scores.lock().unwrap().pop().expect("score script exhausted");
            Ok(QualityScore {
                overall,
                factors: Default::default(),
                analysis: String::new(),
                suggestion: Some("simplify the composition".into()),
            })
        }
    }

    struct FailingEnhancer;

    #[async_trait]
    impl PromptEnhancer for FailingEnhancer {
        async fn analyze(&self, _context: &ScriptContext) -> Result<NarrativeStyle> {
            Err(crate::Error::Llm("unreachable".into()))
        }

        async fn enhance(
            &self,
            _request: &SceneRequest,
            _style: Option<&NarrativeStyle>,
            _suggestion: Option<&str>,
        ) -> Result<EnhancedPrompt> {
            Err(crate::Error::Llm("unreachable".into()))
        }
    }

    fn request() -> SceneRequest {
        SceneRequest {
            index: 0,
            scene_count: 3,
            description: "ocean waves at sunset".into(),
            context: None,
            width: 2,
            height: 2,
        }
    }

    fn harness(
        backend: Arc<CountingBackend>,
        max_attempts: u32,
    ) -> (BackendRouter, GenerationConfig, QualityConfig) {
        let generation = GenerationConfig {
            quiescence_gap_ms: 0,
            ..GenerationConfig::default()
        };
        let resources = Arc::new(Mutex::new(ResourceManager::new(Device::Cpu, &generation)));
        let router =
            BackendRouter::new(vec![Box::new(backend)], resources, &generation).unwrap();
        let quality = QualityConfig {
            max_attempts,
            ..QualityConfig::default()
        };
        (router, generation, quality)
    }

    #[tokio::test]
    async fn first_attempt_above_threshold_makes_exactly_one_call() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let (mut router, generation, quality) = harness(Arc::clone(&backend), 3);
        let evaluator = ScriptedEvaluator::new(&[8.0]);

        let accepted = RefinementLoop::new(
            &mut router,
            &StaticEnhancer,
            &evaluator,
            &generation,
            &quality,
        )
        .run(&request(), None, None)
        .await
        .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(accepted.attempts, 1);
        assert_eq!(accepted.acceptance, Acceptance::Threshold);
        assert_eq!(accepted.score, 8.0);
    }

    #[tokio::test]
    async fn exhausted_attempts_accept_the_best_not_the_last() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let (mut router, generation, quality) = harness(Arc::clone(&backend), 3);
        // Rising but never reaching 7.5: best is the third attempt here…
        let evaluator = ScriptedEvaluator::new(&[5.0, 6.0, 6.5]);

        let accepted = RefinementLoop::new(
            &mut router,
            &StaticEnhancer,
            &evaluator,
            &generation,
            &quality,
        )
        .run(&request(), None, None)
        .await
        .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(accepted.acceptance, Acceptance::Best);
        assert_eq!(accepted.score, 6.5);
        // Attempt numbers are encoded in the red channel by the mock.
        assert_eq!(accepted.image.image.get_pixel(0, 0)[0], 2);
    }

    #[tokio::test]
    async fn best_in_the_middle_wins_over_the_last() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let (mut router, generation, quality) = harness(Arc::clone(&backend), 3);
        let evaluator = ScriptedEvaluator::new(&[5.0, 6.9, 4.0]);

        let accepted = RefinementLoop::new(
            &mut router,
            &StaticEnhancer,
            &evaluator,
            &generation,
            &quality,
        )
        .run(&request(), None, None)
        .await
        .unwrap();

        assert_eq!(accepted.score, 6.9);
        assert_eq!(accepted.image.image.get_pixel(0, 0)[0], 1);
    }

    #[tokio::test]
    async fn enhancement_failure_degrades_to_raw_description() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let (mut router, generation, quality) = harness(Arc::clone(&backend), 2);
        let evaluator = ScriptedEvaluator::new(&[9.0]);

        let accepted = RefinementLoop::new(
            &mut router,
            &FailingEnhancer,
            &evaluator,
            &generation,
            &quality,
        )
        .run(&request(), None, None)
        .await
        .unwrap();

        assert!(accepted
            .image
            .params
            .prompt
            .starts_with("ocean waves at sunset"));
    }

    #[tokio::test]
    async fn loop_never_exceeds_the_attempt_cap() {
        for cap in 1..=4u32 {
            let backend = Arc::new(CountingBackend {
                calls: AtomicUsize::new(0),
            });
            let (mut router, generation, quality) = harness(Arc::clone(&backend), cap);
            let evaluator = ScriptedEvaluator::new(&[0.0; 8]);

            let accepted = RefinementLoop::new(
                &mut router,
                &StaticEnhancer,
                &evaluator,
                &generation,
                &quality,
            )
            .run(&request(), None, None)
            .await
            .unwrap();

            assert_eq!(backend.calls.load(Ordering::SeqCst), cap as usize);
            assert_eq!(accepted.attempts, cap);
        }
    }
}
