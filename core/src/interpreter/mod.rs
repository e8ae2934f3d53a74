//! # Scenario Flow Interpreter
//!
//! Runs one compiled scenario against one [`Context`], one step at a time.
//!
//! ## Core Principles
//!
//! 1. **Stack-driven execution**: active step sequences live in a
//!    `Vec<Frame>`; loops push a frame instead of recursing
//! 2. **Single thread of control**: a run never has two steps, hooks or loop
//!    iterations in flight at once
//! 3. **Suspension points**: a run only yields while waiting on a hook
//!    continuation, the request executor, or a `think` pause
//! 4. **Cooperative cancellation**: checked before every step and every loop
//!    iteration, never mid-step
//!
//! A run moves `Ready → Running → {Completed, Failed, Cancelled}` and
//! publishes each state on a `watch` channel.

mod exec_loop;
mod request;

#[cfg(test)]
mod tests;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::compiler::CompiledScenario;
use crate::config::EngineSettings;
use crate::context::Context;
use crate::events::{EngineEvent, EventEmitter};
use crate::executor::{Method, RequestError, RequestExecutor};
use crate::hooks::{HookError, HookRegistry};
use crate::template::{Interpolator, TemplateError};

use exec_loop::Exit;

/* ===================== Run State ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Ready => write!(f, "ready"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/* ===================== Outcome ===================== */

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("{method} {uri} failed: {source}")]
    Request {
        method: Method,
        uri: String,
        #[source]
        source: RequestError,
    },

    #[error("loop over `{expression}` resolved to {found}, expected an array")]
    LoopOverType {
        expression: String,
        found: &'static str,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// How a run ended; handed to the completion callback exactly once
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(RunError),
    Cancelled,
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::Failed(_) => RunState::Failed,
            RunOutcome::Cancelled => RunState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&RunError> {
        match self {
            RunOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/* ===================== Interpreter ===================== */

/// Everything a run reads; all of it shared and immutable
pub(crate) struct Interpreter<'r, E> {
    pub scenario: &'r CompiledScenario,
    pub settings: &'r EngineSettings,
    pub hooks: &'r HookRegistry,
    pub executor: &'r E,
    pub events: &'r EventEmitter,
    pub interpolator: Interpolator,
}

impl<'r, E: RequestExecutor> Interpreter<'r, E> {
    pub fn new(
        scenario: &'r CompiledScenario,
        settings: &'r EngineSettings,
        hooks: &'r HookRegistry,
        executor: &'r E,
        events: &'r EventEmitter,
    ) -> Self {
        Self {
            scenario,
            settings,
            hooks,
            executor,
            events,
            interpolator: Interpolator::new(settings.max_template_depth),
        }
    }

    /// Run the scenario to a terminal state
    pub async fn run(
        &self,
        context: &mut Context,
        cancel: &CancellationToken,
        state: &watch::Sender<RunState>,
    ) -> RunOutcome {
        let run_id = context.run_id();
        let span = info_span!(
            "run",
            %run_id,
            scenario = self.scenario.name.as_deref().unwrap_or("unnamed")
        );

        transition(state, RunState::Running);
        self.events.emit(EngineEvent::Started {
            run_id,
            at: Utc::now(),
        });

        let result = exec_loop::execute(self, context, cancel)
            .instrument(span.clone())
            .await;

        // Loop bindings never outlive the run
        context.clear_scopes();

        let outcome = match result {
            Ok(Exit::Completed) => RunOutcome::Completed,
            Ok(Exit::Cancelled) => RunOutcome::Cancelled,
            Err(err) => {
                span.in_scope(|| warn!(error = %err, "run failed"));
                self.events.emit(EngineEvent::Error {
                    run_id,
                    message: err.to_string(),
                });
                RunOutcome::Failed(err)
            }
        };

        span.in_scope(|| transition(state, outcome.state()));
        self.events.emit(EngineEvent::Done {
            run_id,
            state: outcome.state(),
            at: Utc::now(),
        });

        outcome
    }
}

fn transition(state: &watch::Sender<RunState>, next: RunState) {
    let previous = state.send_replace(next);
    info!(from = %previous, to = %next, "run state changed");
}
