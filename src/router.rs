//! Generation backend router.
//!
//! Holds an ordered list of backend candidates — the remote service first
//! when configured, the in-process pipeline second — and presents them as a
//! single `generate` call. Selection rules:
//!
//! - Each candidate is probed lazily, once, with a short timeout. A failed
//!   probe demotes it for the remainder of the run; demotion is per-run, so
//!   a transient outage does not disable the faster path forever.
//! - Backends that require it get an accelerator reset immediately before
//!   delegation. The remote service is never asked to reset.
//! - Step counts are clamped to a hard ceiling before any backend sees them.
//! - A backend failure (timeout, transport, malformed response) falls
//!   through to the next candidate; only full exhaustion surfaces an error,
//!   and that error is scene-scoped, not run-fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::backend::{GeneratedImage, GenerationParams, ImageBackend, SceneRequest};
use crate::config::GenerationConfig;
use crate::resource::ResourceManager;
use crate::{Error, Result};

struct Candidate {
    backend: Box<dyn ImageBackend>,
    /// `None` = not yet probed, `Some(false)` = demoted for this run.
    probed: Option<bool>,
}

pub struct BackendRouter {
    candidates: Vec<Candidate>,
    resources: Arc<Mutex<ResourceManager>>,
    step_ceiling: u32,
    call_timeout: Duration,
    probe_timeout: Duration,
}

impl BackendRouter {
    pub fn new(
        backends: Vec<Box<dyn ImageBackend>>,
        resources: Arc<Mutex<ResourceManager>>,
        config: &GenerationConfig,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Config(
                "at least one generation backend must be configured".into(),
            ));
        }
        Ok(Self {
            candidates: backends
                .into_iter()
                .map(|backend| Candidate {
                    backend,
                    probed: None,
                })
                .collect(),
            resources,
            step_ceiling: config.step_ceiling,
            call_timeout: Duration::from_secs(config.call_timeout_s),
            probe_timeout: Duration::from_secs(config.probe_timeout_s),
        })
    }

    /// Shared accelerator lifecycle handle.
    pub fn resources(&self) -> &Arc<Mutex<ResourceManager>> {
        &self.resources
    }

    /// Generate one image, trying candidates in order.
    pub async fn generate(
        &mut self,
        request: &SceneRequest,
        params: &GenerationParams,
    ) -> Result<GeneratedImage> {
        let params = self.clamp_steps(params);
        let attempted = self.candidates.len();
        let mut last_error: Option<Error> = None;

        for candidate in &mut self.candidates {
            let name = candidate.backend.name();

            match candidate.probed {
                Some(false) => continue,
                Some(true) => {}
                None => {
                    let alive = matches!(
                        tokio::time::timeout(self.probe_timeout, candidate.backend.probe()).await,
                        Ok(Ok(()))
                    );
                    candidate.probed = Some(alive);
                    if !alive {
                        tracing::warn!(backend = name, "capability probe failed — demoting for this run");
                        last_error = Some(Error::backend(name, "capability probe failed"));
                        continue;
                    }
                    tracing::debug!(backend = name, "capability probe ok");
                }
            }

            if candidate.backend.requires_reset() {
                // ResourceExhausted here is scene-fatal, not fallthrough.
                self.resources.lock().await.reset()?;
            }

            let started = Instant::now();
            match tokio::time::timeout(
                self.call_timeout,
                candidate.backend.generate(request, &params),
            )
            .await
            {
                Ok(Ok(image)) => {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        backend = name,
                        scene = request.index,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "generated scene image"
                    );
                    return Ok(GeneratedImage {
                        image,
                        params: params.clone(),
                        elapsed,
                        backend: name,
                    });
                }
                Ok(Err(error)) => {
                    // Resource exhaustion must not be masked by a fallback.
                    if matches!(error, Error::ResourceExhausted { .. }) {
                        return Err(error);
                    }
                    tracing::warn!(backend = name, scene = request.index, %error, "backend failed — falling through");
                    if candidate.backend.requires_reset() {
                        self.resources.lock().await.mark_dirty();
                    }
                    last_error = Some(error);
                }
                Err(_) => {
                    tracing::warn!(
                        backend = name,
                        scene = request.index,
                        timeout_s = self.call_timeout.as_secs(),
                        "backend call timed out — abandoning and falling through"
                    );
                    if candidate.backend.requires_reset() {
                        // The abandoned call leaves the device in an unknown
                        // state; the next attempt forces a reset anyway.
                        self.resources.lock().await.mark_dirty();
                    }
                    last_error = Some(Error::backend(
                        name,
                        format!("timed out after {}s", self.call_timeout.as_secs()),
                    ));
                }
            }
        }

        Err(Error::BackendsExhausted {
            scene: request.index,
            attempted,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no backend available".into()),
        })
    }

    fn clamp_steps(&self, params: &GenerationParams) -> GenerationParams {
        if params.steps > self.step_ceiling {
            tracing::warn!(
                requested = params.steps,
                ceiling = self.step_ceiling,
                "step count above ceiling — clamping"
            );
            GenerationParams {
                steps: self.step_ceiling,
                ..params.clone()
            }
        } else {
            params.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::{DiffusionPipeline, LocalBackend};
    use async_trait::async_trait;
    use candle_core::Device;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        name: &'static str,
        probe_ok: bool,
        generate_ok: bool,
        probes: AtomicUsize,
        generates: AtomicUsize,
    }

    impl MockBackend {
        fn new(name: &'static str, probe_ok: bool, generate_ok: bool) -> Self {
            Self {
                name,
                probe_ok,
                generate_ok,
                probes: AtomicUsize::new(0),
                generates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageBackend for Arc<MockBackend> {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok {
                Ok(())
            } else {
                Err(Error::backend(self.name, "probe refused"))
            }
        }

        async fn generate(
            &self,
            _request: &SceneRequest,
            params: &GenerationParams,
        ) -> Result<RgbImage> {
            self.generates.fetch_add(1, Ordering::SeqCst);
            if self.generate_ok {
                assert!(params.steps <= 30, "router must clamp before delegating");
                Ok(RgbImage::new(4, 4))
            } else {
                Err(Error::backend(self.name, "generation refused"))
            }
        }
    }

    fn request() -> SceneRequest {
        SceneRequest {
            index: 0,
            scene_count: 3,
            description: "city skyline at night".into(),
            context: None,
            width: 4,
            height: 4,
        }
    }

    fn params(steps: u32) -> GenerationParams {
        GenerationParams {
            prompt: "city skyline at night".into(),
            negative_prompt: "blurry".into(),
            sampler: "DPM++ 2M Karras".into(),
            steps,
            guidance: 7.5,
            seed: None,
            guide: None,
        }
    }

    fn resources() -> Arc<Mutex<ResourceManager>> {
        let mut config = GenerationConfig::default();
        config.quiescence_gap_ms = 0;
        Arc::new(Mutex::new(ResourceManager::new(Device::Cpu, &config)))
    }

    fn router(backends: Vec<Box<dyn ImageBackend>>) -> BackendRouter {
        BackendRouter::new(backends, resources(), &GenerationConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn failed_probe_demotes_for_the_whole_run() {
        let first = Arc::new(MockBackend::new("remote", false, true));
        let second = Arc::new(MockBackend::new("local-mock", true, true));
        let mut router = router(vec![
            Box::new(Arc::clone(&first)),
            Box::new(Arc::clone(&second)),
        ]);

        for _ in 0..3 {
            let image = router.generate(&request(), &params(12)).await.unwrap();
            assert_eq!(image.backend, "local-mock");
        }

        // The dead candidate was probed exactly once and never generated.
        assert_eq!(first.probes.load(Ordering::SeqCst), 1);
        assert_eq!(first.generates.load(Ordering::SeqCst), 0);
        assert_eq!(second.generates.load(Ordering::SeqCst), 3);
    }

    struct HangingProbeBackend;

    #[async_trait]
    impl ImageBackend for HangingProbeBackend {
        fn name(&self) -> &'static str {
            "remote"
        }

        async fn probe(&self) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn generate(
            &self,
            _request: &SceneRequest,
            _params: &GenerationParams,
        ) -> Result<RgbImage> {
            Ok(RgbImage::new(4, 4))
        }
    }

    #[tokio::test]
    async fn probe_timeout_demotes_like_a_probe_failure() {
        let healthy = Arc::new(MockBackend::new("local-mock", true, true));
        let config = GenerationConfig {
            probe_timeout_s: 0,
            ..GenerationConfig::default()
        };
        let mut router = BackendRouter::new(
            vec![Box::new(HangingProbeBackend), Box::new(Arc::clone(&healthy))],
            resources(),
            &config,
        )
        .unwrap();

        let image = router.generate(&request(), &params(12)).await.unwrap();
        assert_eq!(image.backend, "local-mock");
    }

    #[tokio::test]
    async fn generation_failure_falls_through_to_next_candidate() {
        let first = Arc::new(MockBackend::new("remote", true, false));
        let second = Arc::new(MockBackend::new("local-mock", true, true));
        let mut router = router(vec![
            Box::new(Arc::clone(&first)),
            Box::new(Arc::clone(&second)),
        ]);

        let image = router.generate(&request(), &params(12)).await.unwrap();
        assert_eq!(image.backend, "local-mock");
        // The failing candidate stays probed-alive and is retried next call.
        assert_eq!(first.generates.load(Ordering::SeqCst), 1);

        router.generate(&request(), &params(12)).await.unwrap();
        assert_eq!(first.generates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_scene_and_attempt_count() {
        let only = Arc::new(MockBackend::new("remote", true, false));
        let mut router = router(vec![Box::new(Arc::clone(&only))]);

        let err = router.generate(&request(), &params(12)).await.unwrap_err();
        match err {
            Error::BackendsExhausted {
                scene, attempted, ..
            } => {
                assert_eq!(scene, 0);
                assert_eq!(attempted, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn steps_are_clamped_not_refused() {
        let only = Arc::new(MockBackend::new("remote", true, true));
        let mut router = router(vec![Box::new(Arc::clone(&only))]);

        let image = router.generate(&request(), &params(90)).await.unwrap();
        assert_eq!(image.params.steps, 30);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_config_error() {
        let result = BackendRouter::new(vec![], resources(), &GenerationConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    struct NoopPipeline {
        device: Device,
    }

    impl DiffusionPipeline for NoopPipeline {
        fn device(&self) -> &Device {
            &self.device
        }

        fn generate(
            &mut self,
            request: &SceneRequest,
            _params: &GenerationParams,
        ) -> Result<RgbImage> {
            Ok(RgbImage::new(request.width, request.height))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_remote_routes_all_scenes_local_with_reset_before_each() {
        let remote = Arc::new(MockBackend::new("remote", false, true));
        let shared = resources();
        let local = LocalBackend::new(
            Box::new(NoopPipeline { device: Device::Cpu }),
            Arc::clone(&shared),
        );
        let mut router = BackendRouter::new(
            vec![Box::new(Arc::clone(&remote)), Box::new(local)],
            Arc::clone(&shared),
            &GenerationConfig {
                quiescence_gap_ms: 0,
                ..GenerationConfig::default()
            },
        )
        .unwrap();

        for scene in 0..3 {
            let mut request = request();
            request.index = scene;
            let image = router.generate(&request, &params(12)).await.unwrap();
            assert_eq!(image.backend, "local");
            // Reset ran before this generation, and the generation itself
            // re-dirtied the snapshot.
            let snapshot = shared.lock().await.snapshot();
            assert_eq!(snapshot.epoch, scene as u64 + 1);
            assert!(snapshot.dirty);
        }
        assert_eq!(remote.probes.load(Ordering::SeqCst), 1);
        assert_eq!(remote.generates.load(Ordering::SeqCst), 0);
    }
}
