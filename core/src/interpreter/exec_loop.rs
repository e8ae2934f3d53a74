//! Core execution loop
//!
//! `execute` drives a stack of frames. The bottom frame holds the scenario's
//! top-level steps; each entered loop pushes a frame holding its body and
//! iteration state, and pops it (together with its context scope) when the
//! last iteration finishes.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Interpreter, RunError};
use crate::compiler::{CompiledLoop, CompiledStep, LoopSource};
use crate::context::Context;
use crate::executor::RequestExecutor;
use crate::hooks::invoke_function;
use crate::template::kind_name;

/* ===================== Frames ===================== */

pub(super) enum Exit {
    Completed,
    Cancelled,
}

struct Frame<'s> {
    steps: &'s [CompiledStep],
    idx: usize,
    /// `None` for the top-level frame
    iteration: Option<Iteration>,
}

struct Iteration {
    /// `None` for count loops
    items: Option<Arc<[Value]>>,
    total: usize,
    pos: usize,
}

impl Iteration {
    fn element(&self) -> Option<Value> {
        self.items
            .as_ref()
            .and_then(|items| items.get(self.pos))
            .cloned()
    }

    /// 1-based counter bound as `$loopCount`
    fn count(&self) -> usize {
        self.pos + 1
    }
}

/* ===================== Execution ===================== */

pub(super) async fn execute<E: RequestExecutor>(
    interpreter: &Interpreter<'_, E>,
    context: &mut Context,
    cancel: &CancellationToken,
) -> Result<Exit, RunError> {
    let mut frames = vec![Frame {
        steps: &interpreter.scenario.steps,
        idx: 0,
        iteration: None,
    }];

    while let Some(frame) = frames.last_mut() {
        let steps = frame.steps;

        // Step boundary
        if let Some(step) = steps.get(frame.idx) {
            if cancel.is_cancelled() {
                debug!("cancellation observed before step");
                return Ok(Exit::Cancelled);
            }
            frame.idx += 1;

            match step {
                CompiledStep::Loop(lp) => {
                    if let Some(frame) = enter_loop(interpreter, lp, context)? {
                        frames.push(frame);
                    }
                }
                other => execute_step(interpreter, other, context).await?,
            }
            continue;
        }

        // Frame exhausted: next iteration, or leave the loop
        let Some(iteration) = frame.iteration.as_mut() else {
            frames.pop();
            continue;
        };

        if iteration.count() < iteration.total {
            if cancel.is_cancelled() {
                debug!("cancellation observed before iteration");
                return Ok(Exit::Cancelled);
            }
            iteration.pos += 1;
            context.rebind_scope(iteration.element(), iteration.count());
            frame.idx = 0;
        } else {
            context.pop_scope();
            frames.pop();
        }
    }

    Ok(Exit::Completed)
}

/// Resolve a loop's collection and bind its first iteration
///
/// Returns `None` when there is nothing to iterate.
fn enter_loop<'s, E: RequestExecutor>(
    interpreter: &Interpreter<'_, E>,
    lp: &'s CompiledLoop,
    context: &mut Context,
) -> Result<Option<Frame<'s>>, RunError> {
    let (items, total) = match &lp.source {
        LoopSource::Items(items) => (Some(Arc::clone(items)), items.len()),
        LoopSource::Count(count) => (None, usize::try_from(*count).unwrap_or(usize::MAX)),
        LoopSource::Expression(over) => match interpreter.interpolator.resolve(over, context)? {
            Value::Array(items) => {
                let total = items.len();
                (Some(Arc::from(items)), total)
            }
            other => {
                return Err(RunError::LoopOverType {
                    expression: over.source().to_string(),
                    found: kind_name(&other),
                })
            }
        },
    };

    debug!(iterations = total, depth = context.loop_depth() + 1, "entering loop");
    if total == 0 {
        return Ok(None);
    }

    let iteration = Iteration {
        items,
        total,
        pos: 0,
    };
    context.push_scope(iteration.element(), iteration.count());

    Ok(Some(Frame {
        steps: &lp.body,
        idx: 0,
        iteration: Some(iteration),
    }))
}

async fn execute_step<E: RequestExecutor>(
    interpreter: &Interpreter<'_, E>,
    step: &CompiledStep,
    context: &mut Context,
) -> Result<(), RunError> {
    match step {
        CompiledStep::Request(request) => interpreter.execute_request(request, context).await,

        CompiledStep::Function(function) => {
            invoke_function(
                &function.name,
                function.hook.as_ref(),
                context,
                interpreter.events,
            )
            .await?;
            Ok(())
        }

        CompiledStep::Think(pause) => {
            debug!(?pause, "thinking");
            if !pause.is_zero() {
                tokio::time::sleep(*pause).await;
            }
            Ok(())
        }

        CompiledStep::Log(message) => {
            let message = interpreter.interpolator.render(message, context)?;
            info!(%message, "scenario log");
            interpreter.events.custom(context, "log", message);
            Ok(())
        }

        // Entered by `execute`, which owns the frame stack
        CompiledStep::Loop(_) => Ok(()),
    }
}
