//! Accelerator resource lifecycle.
//!
//! The in-process generation backend holds exclusive, stateful accelerator
//! memory. [`ResourceManager`] is the only component allowed to mutate the
//! process-wide [`ResourceSnapshot`]; the router and backends read it and
//! drive state changes exclusively through this interface.
//!
//! Three operations matter:
//!
//! - [`ResourceManager::reset`] — force a known-clean state before a
//!   generation: synchronization barrier, re-measure, and an aggressive
//!   second pass when usage stays above the configured ceiling.
//! - [`ResourceManager::quiesce`] — enforce a short gap between consecutive
//!   in-process generations. Back-to-back submissions can wedge the driver
//!   in a state that never returns; the gap is a required workaround, not
//!   an optimization.
//! - [`ResourceManager::mark_generation`] — bookkeeping after each
//!   generation: bumps the epoch, flags the state dirty, and arms the
//!   quiescence timer.

use std::time::{Duration, Instant};

use candle_core::Device;

use crate::config::GenerationConfig;
use crate::{Error, Result};

/// Observed accelerator state. Exactly one live instance per process, owned
/// by the [`ResourceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Estimated allocated device memory in bytes (0 when not measurable).
    pub allocated_bytes: u64,
    /// Monotonic generation counter.
    pub epoch: u64,
    /// True between a generation and the next successful reset.
    pub dirty: bool,
}

/// Settle time granted to the driver during the aggressive reset pass.
const AGGRESSIVE_SETTLE: Duration = Duration::from_millis(200);

pub struct ResourceManager {
    device: Device,
    ceiling_bytes: u64,
    quiescence_gap: Duration,
    snapshot: ResourceSnapshot,
    last_generation: Option<Instant>,
}

impl ResourceManager {
    pub fn new(device: Device, config: &GenerationConfig) -> Self {
        Self {
            device,
            ceiling_bytes: config.vram_ceiling_bytes,
            quiescence_gap: Duration::from_millis(config.quiescence_gap_ms),
            snapshot: ResourceSnapshot {
                allocated_bytes: 0,
                epoch: 0,
                dirty: false,
            },
            last_generation: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot
    }

    /// Force the accelerator into a known-clean state.
    ///
    /// Blocks on a device synchronization barrier, re-measures usage, and —
    /// if usage is still above the ceiling — runs a second, more aggressive
    /// pass (block until idle, settle, re-measure). Usage still above the
    /// ceiling after that surfaces as [`Error::ResourceExhausted`] instead of
    /// risking a generation that would wedge the device.
    pub fn reset(&mut self) -> Result<ResourceSnapshot> {
        self.device.synchronize()?;
        self.remeasure();

        if self.snapshot.allocated_bytes > self.ceiling_bytes {
            tracing::warn!(
                allocated_mb = self.snapshot.allocated_bytes / (1024 * 1024),
                ceiling_mb = self.ceiling_bytes / (1024 * 1024),
                "usage above ceiling after reset — running aggressive pass"
            );
            self.device.synchronize()?;
            std::thread::sleep(AGGRESSIVE_SETTLE);
            self.remeasure();

            if self.snapshot.allocated_bytes > self.ceiling_bytes {
                return Err(Error::ResourceExhausted {
                    allocated_bytes: self.snapshot.allocated_bytes,
                    ceiling_bytes: self.ceiling_bytes,
                });
            }
        }

        self.snapshot.dirty = false;
        tracing::debug!(
            allocated_mb = self.snapshot.allocated_bytes / (1024 * 1024),
            epoch = self.snapshot.epoch,
            "accelerator reset"
        );
        Ok(self.snapshot)
    }

    /// Run a reset only when measured usage exceeds `threshold_bytes`.
    /// Returns whether a reset was performed.
    pub fn release_if_above(&mut self, threshold_bytes: u64) -> Result<bool> {
        self.remeasure();
        if self.snapshot.allocated_bytes > threshold_bytes {
            self.reset()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Wait out the remainder of the mandatory gap since the last generation.
    pub async fn quiesce(&self) {
        if let Some(last) = self.last_generation {
            let elapsed = last.elapsed();
            if elapsed < self.quiescence_gap {
                let remaining = self.quiescence_gap - elapsed;
                tracing::debug!(remaining_ms = remaining.as_millis() as u64, "quiescing");
                tokio::time::sleep(remaining).await;
            }
        }
    }

    /// Record a completed generation.
    pub fn mark_generation(&mut self) {
        self.snapshot.epoch += 1;
        self.snapshot.dirty = true;
        self.last_generation = Some(Instant::now());
    }

    /// Flag the state dirty without bumping the epoch — used when a call is
    /// abandoned (timeout) and its device state is unknown.
    pub fn mark_dirty(&mut self) {
        self.snapshot.dirty = true;
    }

    fn remeasure(&mut self) {
        if matches!(self.device, Device::Cuda(_)) {
            match allocated_vram_bytes() {
                Ok(bytes) => self.snapshot.allocated_bytes = bytes,
                Err(error) => {
                    tracing::debug!(%error, "could not query device memory, keeping last estimate");
                }
            }
        } else {
            self.snapshot.allocated_bytes = 0;
        }
    }
}

/// Query allocated memory on the first CUDA device.
#[cfg(feature = "cuda")]
fn allocated_vram_bytes() -> std::result::Result<u64, String> {
    cudarc::runtime::result::get_mem_info()
        .map(|(free, total)| (total - free) as u64)
        .map_err(|e| format!("cudaMemGetInfo failed: {e}"))
}

#[cfg(not(feature = "cuda"))]
fn allocated_vram_bytes() -> std::result::Result<u64, String> {
    Err("CUDA not compiled in".into())
}
