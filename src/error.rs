//! Error types for shortsmith.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A single backend failed: probe, transport, timeout, or a malformed
    /// response. Transient — the router falls through to the next candidate.
    #[error("backend {backend}: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// Every configured backend failed for one scene.
    #[error("scene {scene}: all {attempted} backend(s) failed, last error: {last}")]
    BackendsExhausted {
        scene: usize,
        attempted: usize,
        last: String,
    },

    /// Accelerator memory would not clean up below the configured ceiling,
    /// even after the aggressive pass. Fatal for the current scene.
    #[error("accelerator memory exhausted: {allocated_bytes} bytes allocated, ceiling {ceiling_bytes}")]
    ResourceExhausted {
        allocated_bytes: u64,
        ceiling_bytes: u64,
    },

    /// Render-graph construction or ffmpeg invocation failure.
    #[error("assembly: {0}")]
    Assembly(String),

    /// Invalid or incomplete configuration. Raised at startup, never mid-run.
    #[error("config: {0}")]
    Config(String),

    /// Speech synthesis failure.
    #[error("voice: {0}")]
    Voice(String),

    /// Chat-completion transport or protocol error (prompt enhancement,
    /// quality evaluation). Callers treat these as best-effort.
    #[error("llm: {0}")]
    Llm(String),

    /// One or more scene slots failed after the remaining scenes were
    /// processed. Carries both sides so the caller can report what succeeded.
    #[error("{} scene(s) failed, {} succeeded", failed.len(), succeeded.len())]
    SceneFailures {
        failed: Vec<(usize, String)>,
        succeeded: Vec<usize>,
    },

    /// Candle device error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// HTTP transport error.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decode/encode error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a transient backend failure.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Error::Backend {
            backend,
            message: message.into(),
        }
    }

    /// True for failures the router may recover from by falling through to
    /// the next backend candidate.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::backend("remote", "connection refused").is_transient());
        assert!(!Error::ResourceExhausted {
            allocated_bytes: 1,
            ceiling_bytes: 0
        }
        .is_transient());
        assert!(!Error::Config("missing backend".into()).is_transient());
    }

    #[test]
    fn scene_failures_display_counts_both_sides() {
        let err = Error::SceneFailures {
            failed: vec![(1, "backend exhausted".into())],
            succeeded: vec![0, 2],
        };
        assert_eq!(err.to_string(), "1 scene(s) failed, 2 succeeded");
    }
}
