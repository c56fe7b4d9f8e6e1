//! Generation backend contract and request/response types.
//!
//! Exactly two production implementations exist behind [`ImageBackend`]:
//! the remote HTTP inference service ([`remote::RemoteBackend`]) and the
//! in-process pipeline wrapper ([`local::LocalBackend`]). The router never
//! inspects concrete types — it holds an ordered list of trait objects.

pub mod local;
pub mod remote;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;

use crate::Result;

/// Full-script context attached to scene requests so enhancement and
/// evaluation can reason about narrative fit.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub title: String,
    pub topic: String,
    pub narration: String,
}

/// One scene's generation request. Immutable once created; owned by the
/// refinement loop for the duration of that scene's processing.
#[derive(Debug, Clone)]
pub struct SceneRequest {
    pub index: usize,
    /// Total scenes in the run, used to place this scene in the narrative arc.
    pub scene_count: usize,
    pub description: String,
    pub context: Option<ScriptContext>,
    pub width: u32,
    pub height: u32,
}

/// Parameters for one generation attempt. Produced by prompt enhancement and
/// never mutated — each refinement attempt builds a fresh instance.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: String,
    pub steps: u32,
    pub guidance: f64,
    /// `None` lets the backend choose (non-deterministic output).
    pub seed: Option<u64>,
    /// Previous accepted scene image, fed as a structural guide when
    /// continuity is enabled. Backends that cannot honor it ignore it.
    pub guide: Option<PathBuf>,
}

/// A generated image plus the provenance needed for diagnostics.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: RgbImage,
    pub params: GenerationParams,
    /// Wall-clock generation time, stamped by the router.
    pub elapsed: Duration,
    /// Identity of the backend that produced the image, stamped by the router.
    pub backend: &'static str,
}

/// The closed generation contract.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Stable identity recorded on every generated image.
    fn name(&self) -> &'static str;

    /// True when the shared accelerator must be reset before delegating a
    /// generation to this backend. The remote service manages its own
    /// accelerator out of process and must never be asked to reset.
    fn requires_reset(&self) -> bool {
        false
    }

    /// Lightweight liveness/capability check. A failed probe demotes the
    /// backend for the remainder of the run.
    async fn probe(&self) -> Result<()>;

    /// Produce one image for the request.
    async fn generate(
        &self,
        request: &SceneRequest,
        params: &GenerationParams,
    ) -> Result<RgbImage>;
}
