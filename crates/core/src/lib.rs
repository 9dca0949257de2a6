//! Core crate for restora: tiled face restoration and super-resolution.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod logging;
pub mod model_cache;
pub mod model_registry;
pub mod pipeline;
pub mod resize;
pub mod runtime;
pub mod session;
pub mod tensor_codec;
pub mod tiler;
pub mod types;
pub mod worker;

pub use backend::InferenceBackend;
pub use error::PipelineError;
pub use events::{PipelineEvent, PipelineEvents};
pub use pipeline::{Orchestrator, PipelineOptions, PipelineState};
pub use types::{PixelBuffer, PlanarTensor, Tile};
