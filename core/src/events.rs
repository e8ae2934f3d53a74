//! Engine events
//!
//! Runs publish what they do on an [`EventEmitter`]; hooks receive the same
//! emitter and may publish their own [`EngineEvent::Custom`] events. The core
//! never reads the events it emits.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::context::Context;
use crate::executor::Method;
use crate::interpreter::RunState;

/// Something observable that happened during a run
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started {
        run_id: Uuid,
        at: DateTime<Utc>,
    },
    Request {
        run_id: Uuid,
        method: Method,
        uri: String,
        name: Option<String>,
    },
    Response {
        run_id: Uuid,
        status: u16,
        elapsed: Duration,
    },
    Error {
        run_id: Uuid,
        message: String,
    },
    /// Published by hooks and `log` steps
    Custom {
        run_id: Uuid,
        name: String,
        payload: Value,
    },
    Done {
        run_id: Uuid,
        state: RunState,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::Started { run_id, .. }
            | EngineEvent::Request { run_id, .. }
            | EngineEvent::Response { run_id, .. }
            | EngineEvent::Error { run_id, .. }
            | EngineEvent::Custom { run_id, .. }
            | EngineEvent::Done { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Clone)]
enum Sink {
    Unbounded(mpsc::UnboundedSender<EngineEvent>),
    Bounded(mpsc::Sender<EngineEvent>),
}

/// Publish-only event channel
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sink: Option<Sink>,
}

impl EventEmitter {
    /// Create an emitter and the receiving end of an unbounded channel
    ///
    /// Every event is queued until the receiver reads it. A receiver that is
    /// kept alive but never drained grows the queue for as long as runs keep
    /// publishing; use [`EventEmitter::bounded`] when that can happen.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sink: Some(Sink::Unbounded(tx)),
            },
            rx,
        )
    }

    /// Create an emitter whose queue holds at most `capacity` events
    ///
    /// Events published while the queue is full are dropped.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                sink: Some(Sink::Bounded(tx)),
            },
            rx,
        )
    }

    /// An emitter that discards everything
    pub fn noop() -> Self {
        Self { sink: None }
    }

    /// Publish an event. A closed or full channel is not an error.
    pub fn emit(&self, event: EngineEvent) {
        match &self.sink {
            Some(Sink::Unbounded(tx)) => {
                let _ = tx.send(event);
            }
            Some(Sink::Bounded(tx)) => {
                if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                    trace!(run_id = %event.run_id(), "event queue full, dropping event");
                }
            }
            None => {}
        }
    }

    /// Publish a named event on behalf of the run owning `context`
    pub fn custom(&self, context: &Context, name: impl Into<String>, payload: impl Into<Value>) {
        self.emit(EngineEvent::Custom {
            run_id: context.run_id(),
            name: name.into(),
            payload: payload.into(),
        });
    }
}
