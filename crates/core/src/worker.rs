//! The execution context: a dedicated thread that owns the model bytes and
//! inference sessions and runs one request at a time.
//!
//! The orchestrator talks to it over an unbounded command channel; each
//! request carries its own bounded event channel back to the caller. Event
//! sends block on the caller's runtime handle and give up as soon as the
//! context is cancelled, so a full channel never pins the thread.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::InferenceBackend;
use crate::error::PipelineError;
use crate::events::PipelineEvent;
use crate::model_registry::{ModelDescriptor, ModelRole};
use crate::resize::resize;
use crate::session::{SessionFactory, SessionManager};
use crate::tensor_codec::{from_tensor, to_tensor};
use crate::tiler::{self, TileGrid};
use crate::types::{PixelBuffer, Tile};

/// A model's descriptor together with its weights.
#[derive(Debug, Clone)]
pub struct ModelBlob {
    pub descriptor: ModelDescriptor,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct PipelineRequest {
    pub image: PixelBuffer,
    pub backend: InferenceBackend,
    pub use_face_restore: bool,
    pub use_super_res: bool,
}

pub(crate) enum WorkerCommand {
    Run {
        request: PipelineRequest,
        /// Present only on the first request after a (re)load.
        models: Option<Vec<ModelBlob>>,
        events: mpsc::Sender<PipelineEvent>,
    },
}

pub(crate) struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Must be called from within a tokio runtime; its handle drives the
    /// worker's event sends.
    pub(crate) fn spawn(
        factory: Arc<dyn SessionFactory>,
        tile_size: u32,
    ) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|e| {
            PipelineError::ExecutionContext(format!("no tokio runtime to drive the worker: {e}"))
        })?;
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let busy = Arc::new(AtomicBool::new(false));

        let context = ExecutionContext {
            sessions: SessionManager::new(factory),
            models: HashMap::new(),
            tile_size,
            cancel: cancel.clone(),
            busy: busy.clone(),
            runtime,
        };

        let thread = thread::Builder::new()
            .name("restora-worker".into())
            .spawn(move || context.run(rx))
            .map_err(|e| PipelineError::ExecutionContext(format!("failed to spawn worker thread: {e}")))?;

        debug!(tile_size, "Execution context started");

        Ok(Self {
            commands,
            cancel,
            busy,
            thread: Some(thread),
        })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark the worker busy and queue `command`. On failure the command is
    /// handed back so its buffers can be recovered.
    pub(crate) fn submit(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        self.busy.store(true, Ordering::SeqCst);
        self.commands.send(command).map_err(|err| {
            self.busy.store(false, Ordering::SeqCst);
            err.0
        })
    }

    /// Cancel any in-flight request and close the command channel. Returns
    /// the thread handle when the worker is idle; a busy worker may be in
    /// the middle of a model run and is detached instead. Pending event
    /// sends observe the cancellation, so joining never waits on the caller.
    pub(crate) fn shutdown(mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        let thread = self.thread.take();
        if self.is_busy() {
            debug!("Worker busy at shutdown, detaching thread");
            return None;
        }
        thread
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
impl WorkerHandle {
    /// A handle whose worker has already gone away.
    pub(crate) fn disconnected() -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            commands,
            cancel: CancellationToken::new(),
            busy: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

/// Clears the busy flag when dropped, including while unwinding.
struct IdleOnDrop(Arc<AtomicBool>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Abort {
    /// Cancelled, or the caller stopped listening. Nothing more is sent.
    Silent,
    Failed(PipelineError),
}

impl From<PipelineError> for Abort {
    fn from(err: PipelineError) -> Self {
        Self::Failed(err)
    }
}

fn inference_error(err: anyhow::Error) -> Abort {
    Abort::Failed(PipelineError::Inference(format!("{err:#}")))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Send `event` unless the context is cancelled first. Returns whether the
/// caller received it.
fn deliver(
    runtime: &Handle,
    cancel: &CancellationToken,
    events: &mpsc::Sender<PipelineEvent>,
    event: PipelineEvent,
) -> bool {
    runtime.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = events.send(event) => sent.is_ok(),
        }
    })
}

struct ExecutionContext {
    sessions: SessionManager,
    models: HashMap<ModelRole, ModelBlob>,
    tile_size: u32,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    runtime: Handle,
}

impl ExecutionContext {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let _idle = IdleOnDrop(self.busy.clone());
        while let Some(command) = commands.blocking_recv() {
            if self.cancel.is_cancelled() {
                break;
            }
            match command {
                WorkerCommand::Run {
                    request,
                    models,
                    events,
                } => {
                    if let Some(models) = models {
                        self.install_models(models);
                    }
                    self.handle(request, &events);
                }
            }
        }
        debug!("Execution context stopped");
    }

    fn install_models(&mut self, models: Vec<ModelBlob>) {
        for blob in models {
            self.sessions.invalidate(&blob.descriptor.key);
            debug!(model = %blob.descriptor.key, bytes = blob.bytes.len(), "Model received");
            self.models.insert(blob.descriptor.role, blob);
        }
    }

    fn handle(&mut self, request: PipelineRequest, events: &mpsc::Sender<PipelineEvent>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(request, events)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref()).to_string();
                error!(panic = %message, "Request panicked");
                Err(Abort::Failed(PipelineError::Inference(format!(
                    "execution context panicked: {message}"
                ))))
            });
        // Clear before the terminal event so a caller reacting to it can
        // submit the next request immediately.
        self.busy.store(false, Ordering::SeqCst);

        match outcome {
            Ok(elapsed_ms) => {
                info!(elapsed_ms = format!("{elapsed_ms:.0}"), "Request complete");
                deliver(
                    &self.runtime,
                    &self.cancel,
                    events,
                    PipelineEvent::Complete { elapsed_ms },
                );
            }
            Err(Abort::Silent) => debug!("Request aborted"),
            Err(Abort::Failed(err)) => {
                self.sessions.reset();
                warn!(error = %err, "Request failed");
                deliver(
                    &self.runtime,
                    &self.cancel,
                    events,
                    PipelineEvent::Error(err.to_string()),
                );
            }
        }
    }

    fn process(
        &mut self,
        request: PipelineRequest,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> Result<f64, Abort> {
        let PipelineRequest {
            mut image,
            backend,
            use_face_restore,
            use_super_res,
        } = request;

        let send = |event: PipelineEvent| -> Result<(), Abort> {
            if deliver(&self.runtime, &self.cancel, events, event) {
                Ok(())
            } else {
                Err(Abort::Silent)
            }
        };

        self.sessions.select_backend(backend);
        let mut elapsed_ms = 0.0_f64;

        if use_face_restore {
            let blob = self
                .models
                .get(&ModelRole::FaceRestoration)
                .ok_or_else(|| PipelineError::Inference("face restoration model not loaded".into()))?;
            send(PipelineEvent::Status("Restoring faces".into()))?;

            let started = Instant::now();
            let (width, height) = (image.width(), image.height());
            let working = blob.descriptor.working_size;
            let input = match working {
                Some(size) => resize(&image, size, size).map_err(inference_error)?,
                None => image,
            };
            let restored = infer(&mut self.sessions, blob, backend, &input)?;
            image = resize(&restored, width, height).map_err(inference_error)?;
            elapsed_ms += started.elapsed().as_secs_f64() * 1000.0;

            if !use_super_res {
                send(PipelineEvent::IntermediateResult(image))?;
                return Ok(elapsed_ms);
            }
            send(PipelineEvent::IntermediateResult(image.clone()))?;
        }

        if use_super_res {
            let blob = self
                .models
                .get(&ModelRole::SuperResolution)
                .ok_or_else(|| PipelineError::Inference("super-resolution model not loaded".into()))?;
            let scale = blob.descriptor.scale;
            let grid = TileGrid::new(image.width(), image.height(), self.tile_size)
                .map_err(inference_error)?;

            send(PipelineEvent::Status(format!("Upscaling {} tiles", grid.len())))?;
            send(PipelineEvent::Initialize {
                width: image.width() * scale,
                height: image.height() * scale,
            })?;

            for (index, rect) in grid.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(Abort::Silent);
                }

                let started = Instant::now();
                let input = tiler::extract(&image, rect.x, rect.y, rect.width, rect.height)
                    .map_err(inference_error)?;
                let upscaled = infer(&mut self.sessions, blob, backend, &input).map_err(|abort| {
                    match abort {
                        Abort::Failed(PipelineError::Inference(detail)) => Abort::Failed(
                            PipelineError::Inference(format!("tile {index} at ({}, {}): {detail}", rect.x, rect.y)),
                        ),
                        other => other,
                    }
                })?;
                elapsed_ms += started.elapsed().as_secs_f64() * 1000.0;

                send(PipelineEvent::Tile {
                    tile: Tile {
                        x: rect.x,
                        y: rect.y,
                        width: rect.width,
                        height: rect.height,
                        buffer: upscaled,
                    },
                    out_x: rect.x * scale,
                    out_y: rect.y * scale,
                })?;
            }
        }

        Ok(elapsed_ms)
    }
}

/// Encode `input`, run it through `blob`'s session and decode the result,
/// checking that the output is exactly `scale` times the input.
fn infer(
    sessions: &mut SessionManager,
    blob: &ModelBlob,
    backend: InferenceBackend,
    input: &PixelBuffer,
) -> Result<PixelBuffer, Abort> {
    let scale = blob.descriptor.scale;
    let session = sessions.ensure(&blob.descriptor, &blob.bytes, backend)?;

    let encoded = to_tensor(input).map_err(inference_error)?;
    let output = session.run(&encoded).map_err(inference_error)?;

    let (out_w, out_h) = (input.width() * scale, input.height() * scale);
    if output.width() != out_w || output.height() != out_h {
        return Err(Abort::Failed(PipelineError::Inference(format!(
            "model {} produced {}x{}, expected {}x{}",
            blob.descriptor.key,
            output.width(),
            output.height(),
            out_w,
            out_h
        ))));
    }

    from_tensor(&output, out_w, out_h).map_err(inference_error)
}
