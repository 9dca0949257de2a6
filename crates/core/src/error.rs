//! Error taxonomy surfaced by the pipeline orchestrator.

use thiserror::Error;

use crate::backend::InferenceBackend;

/// Errors returned to pipeline callers.
///
/// Internal plumbing uses `anyhow`; the chain is flattened into `detail` at
/// the boundary so the error stays `Clone` and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A model blob could not be downloaded. Fatal to model loading.
    #[error("failed to fetch model {key}: {detail}")]
    NetworkFetch { key: String, detail: String },

    /// A session could not be compiled for the selected backend.
    #[error("failed to initialize {backend} backend for model {key}: {detail}")]
    BackendInit {
        key: String,
        backend: InferenceBackend,
        detail: String,
    },

    /// Inference, decoding or shape validation failed mid-request.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The caller used the orchestrator out of order.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The execution context could not be reached or started.
    #[error("execution context unavailable: {0}")]
    ExecutionContext(String),
}

impl PipelineError {
    pub(crate) fn network(key: &str, err: &anyhow::Error) -> Self {
        Self::NetworkFetch {
            key: key.to_string(),
            detail: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_network_error_keeps_context_chain() {
        let err = anyhow!("connection refused").context("Failed to start download");
        let pipeline_err = PipelineError::network("esrgan-v1", &err);
        let text = pipeline_err.to_string();
        assert!(text.contains("esrgan-v1"));
        assert!(text.contains("Failed to start download: connection refused"));
    }

    #[test]
    fn test_backend_init_display() {
        let err = PipelineError::BackendInit {
            key: "gfpgan-v1.4".into(),
            backend: InferenceBackend::Cuda,
            detail: "no device".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to initialize cuda backend for model gfpgan-v1.4: no device"
        );
    }
}
