//! Hooks and continuations
//!
//! Hooks are user functions invoked before a request is issued, after its
//! response arrives, or as standalone `function` steps. Every hook receives a
//! [`Continuation`] and must invoke it exactly once; the run does not advance
//! until it has. Invoking consumes the continuation, so a second call cannot
//! compile. A continuation dropped without being invoked fails the run with
//! [`HookError::ContinuationDropped`] rather than hanging it.
//!
//! Hooks get `&mut Context` for the duration of the call. A hook that
//! finishes its work later (by moving the continuation into a spawned task)
//! can still write variables with [`Continuation::done_with_vars`].

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::Context;
use crate::events::EventEmitter;
use crate::executor::{PendingRequest, Response};

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeRequest,
    AfterResponse,
    Function,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::BeforeRequest => write!(f, "beforeRequest"),
            HookKind::AfterResponse => write!(f, "afterResponse"),
            HookKind::Function => write!(f, "function"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The hook invoked its continuation with an error
    #[error("hook `{hook}` failed: {message}")]
    Failed { hook: String, message: String },

    /// The hook dropped its continuation without invoking it
    #[error("hook `{0}` dropped its continuation without invoking it")]
    ContinuationDropped(String),

    /// A templated hook name resolved to nothing registered
    #[error("no {kind} hook named `{name}` is registered")]
    Unknown { kind: HookKind, name: String },
}

/* ===================== Continuation ===================== */

type Completion = Result<Map<String, Value>, String>;

/// Resumes the run once a hook is finished
#[must_use = "a hook must invoke its continuation exactly once"]
pub struct Continuation {
    tx: oneshot::Sender<Completion>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

impl Continuation {
    /// Resume the run
    pub fn done(self) {
        self.complete(Ok(Map::new()));
    }

    /// Resume the run after writing `vars` into the context
    pub fn done_with_vars(self, vars: Map<String, Value>) {
        self.complete(Ok(vars));
    }

    /// Abort the run with an error
    pub fn fail(self, error: impl fmt::Display) {
        self.complete(Err(error.to_string()));
    }

    /// Resume or abort depending on `result`
    pub fn finish<E: fmt::Display>(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.done(),
            Err(e) => self.fail(e),
        }
    }

    fn complete(self, completion: Completion) {
        // The run may already be gone (its task was aborted); nothing to resume.
        let _ = self.tx.send(completion);
    }
}

/// The interpreter's end of a continuation
pub(crate) struct Resumption {
    hook: String,
    rx: oneshot::Receiver<Completion>,
}

pub(crate) fn continuation(hook: &str) -> (Continuation, Resumption) {
    let (tx, rx) = oneshot::channel();
    (
        Continuation { tx },
        Resumption {
            hook: hook.to_string(),
            rx,
        },
    )
}

impl Resumption {
    /// Wait for the continuation and apply any variables it carries
    pub(crate) async fn wait(self, context: &mut Context) -> Result<(), HookError> {
        match self.rx.await {
            Ok(Ok(vars)) => {
                context.vars.extend(vars);
                Ok(())
            }
            Ok(Err(message)) => Err(HookError::Failed {
                hook: self.hook,
                message,
            }),
            Err(_) => Err(HookError::ContinuationDropped(self.hook)),
        }
    }
}

/* ===================== Hook Capabilities ===================== */

/// Runs before a request is issued; may rewrite the request and the context
pub trait BeforeRequestHook: Send + Sync {
    fn before_request(
        &self,
        request: &mut PendingRequest,
        context: &mut Context,
        events: &EventEmitter,
        next: Continuation,
    );
}

impl<F> BeforeRequestHook for F
where
    F: Fn(&mut PendingRequest, &mut Context, &EventEmitter, Continuation) + Send + Sync,
{
    fn before_request(
        &self,
        request: &mut PendingRequest,
        context: &mut Context,
        events: &EventEmitter,
        next: Continuation,
    ) {
        self(request, context, events, next)
    }
}

/// Runs after a response arrives
pub trait AfterResponseHook: Send + Sync {
    fn after_response(
        &self,
        response: &Response,
        request: &PendingRequest,
        context: &mut Context,
        events: &EventEmitter,
        next: Continuation,
    );
}

impl<F> AfterResponseHook for F
where
    F: Fn(&Response, &PendingRequest, &mut Context, &EventEmitter, Continuation) + Send + Sync,
{
    fn after_response(
        &self,
        response: &Response,
        request: &PendingRequest,
        context: &mut Context,
        events: &EventEmitter,
        next: Continuation,
    ) {
        self(response, request, context, events, next)
    }
}

/// A standalone `function` step
pub trait FunctionHook: Send + Sync {
    fn call(&self, context: &mut Context, events: &EventEmitter, next: Continuation);
}

impl<F> FunctionHook for F
where
    F: Fn(&mut Context, &EventEmitter, Continuation) + Send + Sync,
{
    fn call(&self, context: &mut Context, events: &EventEmitter, next: Continuation) {
        self(context, events, next)
    }
}

/* ===================== Invocation ===================== */

pub(crate) async fn invoke_before_request(
    name: &str,
    hook: &dyn BeforeRequestHook,
    request: &mut PendingRequest,
    context: &mut Context,
    events: &EventEmitter,
) -> Result<(), HookError> {
    debug!(hook = name, kind = %HookKind::BeforeRequest, "invoking hook");
    let (next, resumption) = continuation(name);
    hook.before_request(request, context, events, next);
    resumption.wait(context).await
}

pub(crate) async fn invoke_after_response(
    name: &str,
    hook: &dyn AfterResponseHook,
    response: &Response,
    request: &PendingRequest,
    context: &mut Context,
    events: &EventEmitter,
) -> Result<(), HookError> {
    debug!(hook = name, kind = %HookKind::AfterResponse, "invoking hook");
    let (next, resumption) = continuation(name);
    hook.after_response(response, request, context, events, next);
    resumption.wait(context).await
}

pub(crate) async fn invoke_function(
    name: &str,
    hook: &dyn FunctionHook,
    context: &mut Context,
    events: &EventEmitter,
) -> Result<(), HookError> {
    debug!(hook = name, kind = %HookKind::Function, "invoking hook");
    let (next, resumption) = continuation(name);
    hook.call(context, events, next);
    resumption.wait(context).await
}

/* ===================== Registry ===================== */

/// Named hooks available to scenarios, fixed at engine construction
#[derive(Clone, Default)]
pub struct HookRegistry {
    before_request: HashMap<String, Arc<dyn BeforeRequestHook>>,
    after_response: HashMap<String, Arc<dyn AfterResponseHook>>,
    functions: HashMap<String, Arc<dyn FunctionHook>>,
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    pub fn before_request(&self, name: &str) -> Option<Arc<dyn BeforeRequestHook>> {
        self.before_request.get(name).cloned()
    }

    pub fn after_response(&self, name: &str) -> Option<Arc<dyn AfterResponseHook>> {
        self.after_response.get(name).cloned()
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn FunctionHook>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, kind: HookKind, name: &str) -> bool {
        match kind {
            HookKind::BeforeRequest => self.before_request.contains_key(name),
            HookKind::AfterResponse => self.after_response.contains_key(name),
            HookKind::Function => self.functions.contains_key(name),
        }
    }

    /// Registered names of one kind, sorted
    pub fn names(&self, kind: HookKind) -> Vec<&str> {
        let mut names: Vec<&str> = match kind {
            HookKind::BeforeRequest => self.before_request.keys().map(String::as_str).collect(),
            HookKind::AfterResponse => self.after_response.keys().map(String::as_str).collect(),
            HookKind::Function => self.functions.keys().map(String::as_str).collect(),
        };
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_request", &self.names(HookKind::BeforeRequest))
            .field("after_response", &self.names(HookKind::AfterResponse))
            .field("functions", &self.names(HookKind::Function))
            .finish()
    }
}

#[derive(Default)]
pub struct HookRegistryBuilder {
    registry: HookRegistry,
}

impl HookRegistryBuilder {
    /// Register a before-request closure
    pub fn before_request<F>(self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut PendingRequest, &mut Context, &EventEmitter, Continuation)
            + Send
            + Sync
            + 'static,
    {
        self.before_request_hook(name, Arc::new(hook))
    }

    pub fn before_request_hook(
        mut self,
        name: impl Into<String>,
        hook: Arc<dyn BeforeRequestHook>,
    ) -> Self {
        self.registry.before_request.insert(name.into(), hook);
        self
    }

    /// Register an after-response closure
    pub fn after_response<F>(self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&Response, &PendingRequest, &mut Context, &EventEmitter, Continuation)
            + Send
            + Sync
            + 'static,
    {
        self.after_response_hook(name, Arc::new(hook))
    }

    pub fn after_response_hook(
        mut self,
        name: impl Into<String>,
        hook: Arc<dyn AfterResponseHook>,
    ) -> Self {
        self.registry.after_response.insert(name.into(), hook);
        self
    }

    /// Register a function-step closure
    pub fn function<F>(self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut Context, &EventEmitter, Continuation) + Send + Sync + 'static,
    {
        self.function_hook(name, Arc::new(hook))
    }

    pub fn function_hook(mut self, name: impl Into<String>, hook: Arc<dyn FunctionHook>) -> Self {
        self.registry.functions.insert(name.into(), hook);
        self
    }

    pub fn build(self) -> HookRegistry {
        self.registry
    }
}
