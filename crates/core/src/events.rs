//! Events streamed from the execution context to the caller.

use tokio::sync::mpsc;

use crate::types::{PixelBuffer, Tile};

/// One step of a pipeline request.
///
/// Per request: any number of `Status`, at most one `Initialize` before the
/// first `Tile`, tiles in row-major order, then exactly one of `Complete` or
/// `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(String),
    /// Final output dimensions, sent before any tile.
    Initialize { width: u32, height: u32 },
    /// An upscaled tile and its top-left corner in output space.
    Tile { tile: Tile, out_x: u32, out_y: u32 },
    /// Face-restored image at the input resolution.
    IntermediateResult(PixelBuffer),
    Complete { elapsed_ms: f64 },
    Error(String),
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error(_))
    }
}

/// Receiving half of one request's event stream.
///
/// Dropping it aborts the request at the next event boundary.
#[derive(Debug)]
pub struct PipelineEvents {
    rx: mpsc::Receiver<PipelineEvent>,
    finished: bool,
}

impl PipelineEvents {
    pub(crate) fn new(rx: mpsc::Receiver<PipelineEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    /// Next event, or `None` once the terminal event has been delivered or
    /// the worker went away.
    pub async fn next(&mut self) -> Option<PipelineEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        match &event {
            Some(e) if e.is_terminal() => self.finished = true,
            None => self.finished = true,
            _ => {}
        }
        event
    }

    /// Drain the stream up to and including the terminal event.
    pub async fn collect(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
