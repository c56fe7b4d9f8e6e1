//! Short vertical video generation core.
//!
//! Turns an ordered list of scene descriptions into quality-checked images
//! through one of two interchangeable diffusion backends sharing a scarce
//! accelerator, then assembles the clips, a narration track, and captions
//! into one correctly-synchronized vertical MP4.
//!
//! ## Architecture
//!
//! ```text
//! scene descriptions ──► prompt enhancement ─┐
//!                                            ▼
//!                    ┌────────── refinement loop (quality gate)
//!                    ▼                       │
//!            backend router ◄────────────────┘  per-attempt
//!             │          │
//!     remote service   in-process pipeline ◄── resource lifecycle
//!             │          │                      (reset / quiesce)
//!             └────┬─────┘
//!                  ▼
//!        accepted scene images ──► assembly graph ──► ffmpeg ──► MP4
//!                  narration (parallel) ──────┘
//! ```
//!
//! ## Modules
//!
//! - [`resource`] — accelerator memory lifecycle (reset, quiescence gap)
//! - [`backend`] — the generation contract and its two implementations
//! - [`router`] — ordered candidates, probe demotion, automatic fallback
//! - [`enhance`] / [`quality`] / [`refine`] — the quality-gated loop
//! - [`assemble`] / [`captions`] — the final render graph
//! - [`voice`] / [`scratch`] / [`pipeline`] — narration, artifacts,
//!   orchestration

pub mod assemble;
pub mod backend;
pub mod captions;
pub mod config;
pub mod enhance;
pub mod llm;
pub mod pipeline;
pub mod quality;
pub mod refine;
pub mod resource;
pub mod router;
pub mod scratch;
pub mod voice;

mod error;

pub use error::{Error, Result};

/// Return the preferred accelerator device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> candle_core::Device {
    candle_core::Device::cuda_if_available(cuda_ordinal).unwrap_or(candle_core::Device::Cpu)
}
