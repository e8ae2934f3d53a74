//! Run entry points
//!
//! An [`Engine`] owns what every run shares: configuration, the hook
//! registry and the request executor. [`Engine::create_scenario`] compiles a
//! scenario once; the resulting [`ScenarioRunner`] is cheap to clone and runs
//! any number of virtual users concurrently, each with its own [`Context`].
//!
//! ```ignore
//! let engine = Engine::builder().hooks(hooks).executor(http).build()?;
//! let runner = engine.create_scenario(&spec, EventEmitter::noop())?;
//!
//! let handle = runner.start(Context::default(), |outcome, context| {
//!     println!("{:?} with {} vars", outcome.state(), context.vars.len());
//! });
//! handle.cancel();
//! ```

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::compiler::{CompileError, CompiledScenario, Compiler};
use crate::config::Config;
use crate::context::Context;
use crate::events::EventEmitter;
use crate::executor::RequestExecutor;
use crate::hooks::HookRegistry;
use crate::init;
use crate::interpreter::{Interpreter, RunOutcome, RunState};
use crate::scenario::ScenarioSpec;

/* ===================== Engine ===================== */

pub struct Engine<E> {
    config: Arc<Config>,
    hooks: Arc<HookRegistry>,
    executor: Arc<E>,
}

impl<E> Clone for Engine<E> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            hooks: Arc::clone(&self.hooks),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<E: RequestExecutor> Engine<E> {
    pub fn new(config: Config, hooks: HookRegistry, executor: E) -> Self {
        Self {
            config: Arc::new(config),
            hooks: Arc::new(hooks),
            executor: Arc::new(executor),
        }
    }

    pub fn builder() -> EngineBuilder<E> {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Compile a scenario for repeated runs
    ///
    /// Fails on malformed templates and on literal hook names missing from
    /// the registry.
    pub fn create_scenario(
        &self,
        spec: &ScenarioSpec,
        events: EventEmitter,
    ) -> Result<ScenarioRunner<E>, CompileError> {
        let scenario = Compiler::new(&self.hooks, &self.config.engine).compile(spec)?;
        info!(
            scenario = scenario.name.as_deref().unwrap_or("unnamed"),
            steps = scenario.len(),
            "scenario compiled"
        );

        Ok(ScenarioRunner {
            scenario: Arc::new(scenario),
            engine: self.clone(),
            events,
        })
    }
}

pub struct EngineBuilder<E> {
    config: Option<Config>,
    hooks: HookRegistry,
    executor: Option<E>,
}

impl<E> Default for EngineBuilder<E> {
    fn default() -> Self {
        Self {
            config: None,
            hooks: HookRegistry::default(),
            executor: None,
        }
    }
}

impl<E: RequestExecutor> EngineBuilder<E> {
    /// Use this configuration instead of the one installed by [`init`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn executor(mut self, executor: E) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<Engine<E>> {
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("an engine needs a request executor"))?;

        let config = match self.config {
            Some(config) => config,
            None => init::config().cloned().unwrap_or_default(),
        };
        config.validate()?;

        Ok(Engine::new(config, self.hooks, executor))
    }
}

/* ===================== Scenario Runner ===================== */

/// A compiled scenario bound to an engine
pub struct ScenarioRunner<E> {
    scenario: Arc<CompiledScenario>,
    engine: Engine<E>,
    events: EventEmitter,
}

impl<E> Clone for ScenarioRunner<E> {
    fn clone(&self) -> Self {
        Self {
            scenario: Arc::clone(&self.scenario),
            engine: self.engine.clone(),
            events: self.events.clone(),
        }
    }
}

impl<E: RequestExecutor> ScenarioRunner<E> {
    pub fn scenario(&self) -> &CompiledScenario {
        &self.scenario
    }

    /// Run one virtual user to completion on the current task
    pub async fn run(&self, context: Context, cancel: CancellationToken) -> (RunOutcome, Context) {
        let (state, _) = watch::channel(RunState::Ready);
        self.run_with_state(context, &cancel, &state).await
    }

    /// Spawn one virtual user; `on_done` fires exactly once when it ends
    pub fn start<F>(&self, context: Context, on_done: F) -> RunHandle
    where
        F: FnOnce(RunOutcome, Context) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RunState::Ready);

        let runner = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let (outcome, context) = runner.run_with_state(context, &token, &state_tx).await;
            let state = outcome.state();
            on_done(outcome, context);
            state
        });

        RunHandle {
            cancel,
            state: state_rx,
            join,
        }
    }

    async fn run_with_state(
        &self,
        mut context: Context,
        cancel: &CancellationToken,
        state: &watch::Sender<RunState>,
    ) -> (RunOutcome, Context) {
        let engine = &self.engine;
        let interpreter = Interpreter::new(
            &self.scenario,
            &engine.config.engine,
            &engine.hooks,
            engine.executor.as_ref(),
            &self.events,
        );

        let outcome = interpreter.run(&mut context, cancel, state).await;
        (outcome, context)
    }
}

/* ===================== Run Handle ===================== */

/// Control over a spawned run
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    join: JoinHandle<RunState>,
}

impl RunHandle {
    /// Ask the run to stop at its next step boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Wait for the run to end, after its completion callback has returned
    pub async fn wait(self) -> Result<RunState, JoinError> {
        self.join.await
    }
}
