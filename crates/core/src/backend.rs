//! Inference backend selection and ONNX Runtime session construction.
//!
//! Sessions are built straight from in-memory model bytes; the model blob
//! never touches the filesystem outside the model cache.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Compute execution provider a session is compiled for.
///
/// `Cuda` and `Tensorrt` fall back to CPU inside ONNX Runtime when the
/// provider libraries are missing; the fallback is logged, not an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Compile `model_bytes` into a session for `config.backend`.
///
/// `Tensorrt` registers the TRT provider with engine caching, then CUDA as
/// fallback. `Cuda` registers CUDA only. `Cpu` registers the CPU provider.
pub fn build_session(model_bytes: &[u8], config: &SessionConfig) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let before = cache_stats(&cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            // Engine builds can take minutes; keep a heartbeat in the log.
            let (stop_tx, stop_rx) = channel::<()>();
            let heartbeat = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(tick) {
                    info!(elapsed_secs = elapsed, "TensorRT session initialization still in progress");
                    elapsed += 15;
                }
            });

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_memory(model_bytes)
                .context("Failed to compile ONNX model for TensorRT");

            let _ = stop_tx.send(());
            let _ = heartbeat.join();

            let elapsed_secs = started.elapsed().as_secs_f64();
            let after = cache_stats(&cache_dir);
            match result {
                Ok(session) => {
                    info!(
                        elapsed_secs,
                        cache_updated = after.total_bytes != before.total_bytes,
                        cache_bytes = after.total_bytes,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(err) => {
                    error!(elapsed_secs, error = %err, "TensorRT session initialization failed");
                    return Err(err);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_memory(model_bytes)
                .context("Failed to compile ONNX model for CUDA")?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");
            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_memory(model_bytes)
                .context("Failed to compile ONNX model for CPU")?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy("TensorRT"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("webgpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cpu);
    }

    #[test]
    fn test_backend_default_and_display() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::Cpu.to_string(), "cpu");
        assert_eq!(InferenceBackend::Cuda.to_string(), "cuda");
        assert_eq!(InferenceBackend::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn test_backend_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: InferenceBackend,
        }
        let parsed: Wrapper = toml::from_str("backend = \"trt\"").unwrap();
        assert_eq!(parsed.backend, InferenceBackend::Tensorrt);
        assert_eq!(
            serde_json::to_string(&InferenceBackend::Cuda).unwrap(),
            "\"cuda\""
        );
    }

    #[test]
    fn test_cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("engines")).unwrap();
        std::fs::write(dir.path().join("a.bin"), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join("engines/b.bin"), [0u8; 6]).unwrap();

        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(cache_stats(&dir.path().join("missing")).file_count, 0);
    }

    #[test]
    #[ignore] // needs the ONNX Runtime shared library
    fn test_build_session_rejects_garbage_bytes() {
        let result = build_session(b"not an onnx model", &SessionConfig::default());
        assert!(result.is_err());
    }
}
