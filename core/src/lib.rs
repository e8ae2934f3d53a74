//! Scenario flow interpreter for scripted HTTP load generation
//!
//! A scenario is an ordered flow of steps (requests, loops, hook functions)
//! run once per virtual user. Strings in a scenario are templates resolved
//! against the run's [`Context`]; user hooks run around requests and resume
//! the flow through a [`Continuation`]. Actual HTTP is left to an injected
//! [`RequestExecutor`].

pub mod compiler;
pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod init;
pub mod interpreter;
pub mod runner;
pub mod scenario;
pub mod telemetry;
pub mod template;

pub use compiler::{CompileError, CompiledScenario, Compiler};
pub use config::{Config, EngineSettings, LoggingSettings};
pub use context::Context;
pub use events::{EngineEvent, EventEmitter};
pub use executor::{Method, PendingRequest, RequestError, RequestErrorKind, RequestExecutor, Response};
pub use hooks::{
    AfterResponseHook, BeforeRequestHook, Continuation, FunctionHook, HookError, HookKind,
    HookRegistry,
};
pub use interpreter::{RunError, RunOutcome, RunState};
pub use runner::{Engine, RunHandle, ScenarioRunner};
pub use scenario::{ScenarioSpec, StepSpec};
pub use template::{Template, TemplateError};

// Re-export init API for convenience
pub use init::{initialize, InitBuilder, InitOptions};
