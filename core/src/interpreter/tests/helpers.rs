//! Test helpers for interpreter tests
//!
//! A recording executor, a shared journal for ordering assertions, and a
//! driver that compiles a JSON flow and runs it to completion.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::compiler::Compiler;
use crate::config::EngineSettings;
use crate::context::Context;
use crate::events::{EngineEvent, EventEmitter};
use crate::executor::{PendingRequest, RequestError, RequestExecutor, Response};
use crate::hooks::HookRegistry;
use crate::interpreter::{Interpreter, RunOutcome, RunState};
use crate::scenario::ScenarioSpec;

/// Ordered record of everything hooks and the executor saw
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Answers every request with 200 unless told to fail its URI
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    journal: Journal,
    requests: Arc<Mutex<Vec<PendingRequest>>>,
    failing: Option<String>,
}

impl MockExecutor {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, uri: &str) -> Self {
        self.failing = Some(uri.to_string());
        self
    }

    pub fn requests(&self) -> Vec<PendingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn uris(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.uri).collect()
    }
}

impl RequestExecutor for MockExecutor {
    fn issue(
        &self,
        request: &PendingRequest,
    ) -> impl Future<Output = Result<Response, RequestError>> + Send {
        self.journal
            .push(format!("{} {}", request.method, request.display_name()));
        self.requests.lock().unwrap().push(request.clone());

        let result = if self.failing.as_deref() == Some(request.uri.as_str()) {
            Err(RequestError::network("connection refused"))
        } else {
            Ok(Response::new(200)
                .with_header("content-type", "application/json")
                .with_body(json!({ "uri": request.uri })))
        };

        async move { result }
    }
}

pub struct FlowRun {
    pub outcome: RunOutcome,
    pub context: Context,
    pub events: Vec<EngineEvent>,
    pub state: RunState,
}

pub struct FlowBuilder {
    flow: Value,
    hooks: HookRegistry,
    executor: MockExecutor,
    context: Context,
    settings: EngineSettings,
    cancel: CancellationToken,
}

/// Start describing a run of `flow` (a JSON array of steps)
pub fn flow(flow: Value) -> FlowBuilder {
    FlowBuilder {
        flow,
        hooks: HookRegistry::default(),
        executor: MockExecutor::default(),
        context: Context::default(),
        settings: EngineSettings::default(),
        cancel: CancellationToken::new(),
    }
}

impl FlowBuilder {
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn executor(mut self, executor: MockExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn vars(mut self, vars: Value) -> Self {
        let Value::Object(vars) = vars else {
            panic!("vars must be an object, got {}", vars);
        };
        self.context = Context::new(vars);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(self) -> FlowRun {
        let spec = ScenarioSpec::from_json(json!({ "flow": self.flow })).expect("invalid flow");
        let scenario = Compiler::new(&self.hooks, &self.settings)
            .compile(&spec)
            .expect("flow failed to compile");

        let (events, mut rx) = EventEmitter::channel();
        let (state, state_rx) = watch::channel(RunState::Ready);
        let mut context = self.context;

        let outcome = Interpreter::new(
            &scenario,
            &self.settings,
            &self.hooks,
            &self.executor,
            &events,
        )
        .run(&mut context, &self.cancel, &state)
        .await;

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }

        let state = *state_rx.borrow();
        FlowRun {
            outcome,
            context,
            events: received,
            state,
        }
    }
}
