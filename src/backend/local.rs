//! In-process pipeline backend.
//!
//! The crate does not ship a diffusion model. [`DiffusionPipeline`] is the
//! contract an in-process model implementation must satisfy; anything that
//! can turn a prompt into an RGB image on a candle device plugs in here.
//! [`LocalBackend`] owns the accelerator discipline around each call:
//! quiescence before submission, generation bookkeeping after, and running
//! the blocking inference off the async reactor. The reset itself is driven
//! by the router, which owns the ordering of reset vs. delegation.

use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Device;
use image::RgbImage;
use tokio::sync::Mutex;

use crate::backend::{GenerationParams, ImageBackend, SceneRequest};
use crate::resource::ResourceManager;
use crate::{Error, Result};

const BACKEND_NAME: &str = "local";

/// Contract for an in-process image generation pipeline.
///
/// `generate` is blocking and compute-heavy; [`LocalBackend`] bridges it off
/// the async runtime. Implementations hold their own weights and sampler
/// state but must not touch accelerator lifecycle — that is the caller's job.
pub trait DiffusionPipeline: Send {
    /// Device the pipeline is resident on.
    fn device(&self) -> &Device;

    /// Run one full denoising pass and decode to an RGB image of the
    /// requested dimensions.
    fn generate(&mut self, request: &SceneRequest, params: &GenerationParams)
        -> Result<RgbImage>;
}

pub struct LocalBackend {
    pipeline: std::sync::Mutex<Box<dyn DiffusionPipeline>>,
    resources: Arc<Mutex<ResourceManager>>,
}

impl LocalBackend {
    pub fn new(
        pipeline: Box<dyn DiffusionPipeline>,
        resources: Arc<Mutex<ResourceManager>>,
    ) -> Self {
        tracing::info!(device = ?pipeline.device(), "in-process pipeline registered");
        Self {
            pipeline: std::sync::Mutex::new(pipeline),
            resources,
        }
    }
}

#[async_trait]
impl ImageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn requires_reset(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<()> {
        // The pipeline is resident in-process; a lock acquisition is the
        // cheapest proof it exists and is not wedged.
        self.pipeline
            .lock()
            .map(|_| ())
            .map_err(|_| Error::backend(BACKEND_NAME, "pipeline lock poisoned"))
    }

    async fn generate(
        &self,
        request: &SceneRequest,
        params: &GenerationParams,
    ) -> Result<RgbImage> {
        self.resources.lock().await.quiesce().await;

        let image = tokio::task::block_in_place(|| {
            let mut pipeline = self
                .pipeline
                .lock()
                .map_err(|_| Error::backend(BACKEND_NAME, "pipeline lock poisoned"))?;
            pipeline.generate(request, params)
        })?;

        self.resources.lock().await.mark_generation();
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;

    struct SolidColorPipeline {
        device: Device,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl DiffusionPipeline for SolidColorPipeline {
        fn device(&self) -> &Device {
            &self.device
        }

        fn generate(
            &mut self,
            request: &SceneRequest,
            _params: &GenerationParams,
        ) -> Result<RgbImage> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(RgbImage::from_pixel(
                request.width,
                request.height,
                image::Rgb([40, 40, 60]),
            ))
        }
    }

    fn request() -> SceneRequest {
        SceneRequest {
            index: 0,
            scene_count: 1,
            description: "ocean waves at sunset".into(),
            context: None,
            width: 8,
            height: 8,
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "ocean waves at sunset".into(),
            negative_prompt: String::new(),
            sampler: "DPM++ 2M Karras".into(),
            steps: 12,
            guidance: 7.5,
            seed: Some(7),
            guide: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_records_generation_on_the_shared_manager() {
        let mut config = GenerationConfig::default();
        config.quiescence_gap_ms = 0;
        let resources = Arc::new(Mutex::new(ResourceManager::new(Device::Cpu, &config)));
        let backend = LocalBackend::new(
            Box::new(SolidColorPipeline {
                device: Device::Cpu,
                calls: Default::default(),
            }),
            Arc::clone(&resources),
        );

        assert!(backend.requires_reset());
        backend.probe().await.unwrap();

        let image = backend.generate(&request(), &params()).await.unwrap();
        assert_eq!(image.dimensions(), (8, 8));

        let snapshot = resources.lock().await.snapshot();
        assert_eq!(snapshot.epoch, 1);
        assert!(snapshot.dirty);
    }
}
