//! Caller-facing orchestrator for the restoration pipeline.
//!
//! ```text
//! Idle ──initialize──▶ LoadingModels ──ok──▶ Ready ──upscale──▶ Running
//!                            │                 ▲                   │
//!                            └──err──▶ Failed  └──terminal event───┘
//! ```
//!
//! `terminate()` returns to `Idle` from any state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::error::PipelineError;
use crate::events::PipelineEvents;
use crate::fetch::ModelFetcher;
use crate::model_cache::ModelCache;
use crate::model_registry::ModelDescriptor;
use crate::session::SessionFactory;
use crate::tiler::DEFAULT_TILE_SIZE;
use crate::types::PixelBuffer;
use crate::worker::{ModelBlob, PipelineRequest, WorkerCommand, WorkerHandle};

pub const DEFAULT_EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    LoadingModels,
    Ready,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub tile_size: u32,
    /// Capacity of each request's event channel.
    pub event_buffer: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

pub struct Orchestrator {
    cache: Arc<dyn ModelCache>,
    fetcher: Arc<dyn ModelFetcher>,
    factory: Arc<dyn SessionFactory>,
    options: PipelineOptions,
    state: PipelineState,
    loaded_keys: Vec<String>,
    /// Model bytes awaiting their one-time move into the execution context.
    pending_models: Vec<ModelBlob>,
    models_transferred: bool,
    worker: Option<WorkerHandle>,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<dyn ModelCache>,
        fetcher: Arc<dyn ModelFetcher>,
        factory: Arc<dyn SessionFactory>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            cache,
            fetcher,
            factory,
            options,
            state: PipelineState::Idle,
            loaded_keys: Vec::new(),
            pending_models: Vec::new(),
            models_transferred: false,
            worker: None,
        }
    }

    /// `Running` while a request is streaming, otherwise the stored state.
    pub fn state(&self) -> PipelineState {
        match &self.worker {
            Some(worker) if self.state == PipelineState::Ready && worker.is_busy() => {
                PipelineState::Running
            }
            _ => self.state,
        }
    }

    pub fn models_transferred(&self) -> bool {
        self.models_transferred
    }

    /// Make every model in `descriptors` available, from the cache or the
    /// network. Any fetch failure fails the whole load; models fetched
    /// before the failure stay cached.
    pub async fn initialize(&mut self, descriptors: Vec<ModelDescriptor>) -> Result<(), PipelineError> {
        if self.state() == PipelineState::Running {
            return Err(PipelineError::ProtocolMisuse(
                "cannot initialize while a request is running".into(),
            ));
        }

        if let Some(err) = descriptors.iter().find_map(|d| d.validate().err()) {
            return Err(PipelineError::ProtocolMisuse(format!("invalid model descriptor: {err}")));
        }

        let keys: Vec<String> = descriptors.iter().map(|d| d.key.clone()).collect();
        if self.state == PipelineState::Ready && same_key_set(&keys, &self.loaded_keys) {
            debug!(models = ?keys, "Models already loaded");
            return Ok(());
        }

        self.state = PipelineState::LoadingModels;
        info!(models = ?keys, "Loading models");

        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        let loaded = tokio::task::spawn_blocking(move || load_models(&*cache, &*fetcher, descriptors))
            .await;

        match loaded {
            Ok(Ok(blobs)) => {
                self.pending_models = blobs;
                self.loaded_keys = keys;
                self.models_transferred = false;
                self.state = PipelineState::Ready;
                info!("Models ready");
                Ok(())
            }
            Ok(Err(err)) => {
                self.pending_models.clear();
                self.state = PipelineState::Failed;
                Err(err)
            }
            Err(join_err) => {
                self.state = PipelineState::Failed;
                Err(PipelineError::ExecutionContext(format!(
                    "model loading task failed: {join_err}"
                )))
            }
        }
    }

    /// Start one request. Events for it arrive on the returned stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn upscale(
        &mut self,
        image: PixelBuffer,
        backend: InferenceBackend,
        use_face_restore: bool,
        use_super_res: bool,
    ) -> Result<PipelineEvents, PipelineError> {
        match self.state() {
            PipelineState::Ready => {}
            PipelineState::Running => {
                return Err(PipelineError::ProtocolMisuse(
                    "a request is already in flight".into(),
                ))
            }
            other => {
                return Err(PipelineError::ProtocolMisuse(format!(
                    "models are not loaded (state {other:?})"
                )))
            }
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::ProtocolMisuse("input image is empty".into()));
        }

        if self.worker.is_none() {
            self.worker = Some(WorkerHandle::spawn(
                self.factory.clone(),
                self.options.tile_size,
            )?);
        }
        let Some(worker) = self.worker.as_ref() else {
            return Err(PipelineError::ExecutionContext("worker missing".into()));
        };

        let models = if self.models_transferred {
            None
        } else {
            Some(std::mem::take(&mut self.pending_models))
        };
        let transferring = models.is_some();

        let (events, rx) = mpsc::channel(self.options.event_buffer.max(1));
        let command = WorkerCommand::Run {
            request: PipelineRequest {
                image,
                backend,
                use_face_restore,
                use_super_res,
            },
            models,
            events,
        };

        if let Err(WorkerCommand::Run { models, .. }) = worker.submit(command) {
            self.worker = None;
            match models {
                Some(models) => {
                    self.pending_models = models;
                    warn!("Execution context is gone, it will be restarted on the next request");
                }
                None => {
                    // The model bytes went down with the old context.
                    self.loaded_keys.clear();
                    self.models_transferred = false;
                    self.state = PipelineState::Failed;
                    warn!("Execution context is gone with its models, initialize again");
                }
            }
            return Err(PipelineError::ExecutionContext(
                "execution context stopped".into(),
            ));
        }

        if transferring {
            self.models_transferred = true;
            debug!("Model buffers moved into execution context");
        }
        Ok(PipelineEvents::new(rx))
    }

    /// Stop the execution context and drop all loaded state.
    pub async fn terminate(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Some(thread) = worker.shutdown() {
                if let Err(err) = tokio::task::spawn_blocking(move || thread.join()).await {
                    warn!(error = %err, "Failed to join execution context");
                }
            }
        }
        self.pending_models.clear();
        self.loaded_keys.clear();
        self.models_transferred = false;
        self.state = PipelineState::Idle;
        info!("Pipeline terminated");
    }
}

fn same_key_set(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Blocking. Attempts every model so that successful fetches are cached
/// even when another one fails; the first failure is returned.
fn load_models(
    cache: &dyn ModelCache,
    fetcher: &dyn ModelFetcher,
    descriptors: Vec<ModelDescriptor>,
) -> Result<Vec<ModelBlob>, PipelineError> {
    let mut blobs = Vec::with_capacity(descriptors.len());
    let mut first_error = None;

    for descriptor in descriptors {
        if let Some(bytes) = cache.get(&descriptor.key) {
            debug!(model = %descriptor.key, bytes = bytes.len(), "Loaded model from cache");
            blobs.push(ModelBlob { descriptor, bytes });
            continue;
        }

        match fetcher.fetch(&descriptor) {
            Ok(bytes) => {
                cache.put(&descriptor.key, &bytes);
                blobs.push(ModelBlob { descriptor, bytes });
            }
            Err(err) => {
                warn!(model = %descriptor.key, error = %format!("{err:#}"), "Model fetch failed");
                if first_error.is_none() {
                    first_error = Some(PipelineError::network(&descriptor.key, &err));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(blobs),
    }
}
