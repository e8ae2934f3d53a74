//! Process-wide initialization
//!
//! Host applications call this once at startup, before building engines. It
//! loads configuration, installs the tracing subscriber and keeps the loaded
//! [`Config`] for [`crate::runner::EngineBuilder`] to pick up.
//!
//! # Example
//!
//! ```ignore
//! use barrage_core::init::InitBuilder;
//!
//! // Defaults, `BARRAGE_*` environment and `BARRAGE_CONFIG_PATH`
//! InitBuilder::new().init()?;
//!
//! // Explicit overrides
//! InitBuilder::new()
//!     .config_path("load/barrage.toml")
//!     .target("http://localhost:8080")
//!     .init()?;
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;

use crate::config::Config;
use crate::telemetry;

/// Global initialization state
static INIT_STATE: OnceLock<InitState> = OnceLock::new();

#[derive(Debug)]
struct InitState {
    config: Config,
}

/// Options for initializing the engine
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Config file path (overrides `BARRAGE_CONFIG_PATH`)
    pub config_path: Option<PathBuf>,

    /// Base URL for relative request URIs (overrides config and env)
    pub target: Option<String>,

    /// Log filter directive (overrides config and env)
    pub log_filter: Option<String>,

    /// Whether to install the global tracing subscriber
    pub install_tracing: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            target: None,
            log_filter: None,
            install_tracing: true,
        }
    }
}

/// Builder for constructing InitOptions
#[derive(Debug, Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.options.target = Some(target.into());
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.options.log_filter = Some(filter.into());
        self
    }

    /// Set whether to install the global tracing subscriber
    pub fn install_tracing(mut self, install: bool) -> Self {
        self.options.install_tracing = install;
        self
    }

    pub fn init(self) -> Result<()> {
        initialize(self.options)
    }
}

/// Initialize with the given options
///
/// Calling this more than once is safe; later calls are no-ops.
pub fn initialize(options: InitOptions) -> Result<()> {
    if INIT_STATE.get().is_some() {
        return Ok(());
    }

    let mut builder = Config::builder().config_path(options.config_path);
    if let Some(target) = options.target {
        builder = builder.target(target);
    }
    if let Some(filter) = options.log_filter {
        builder = builder.log_filter(filter);
    }
    let config = builder.build().context("Failed to load configuration")?;

    if options.install_tracing {
        telemetry::init_tracing(&config.logging).context("Failed to initialize tracing")?;
    }

    info!(
        engine_target = config.engine.target.as_deref().unwrap_or("-"),
        max_template_depth = config.engine.max_template_depth,
        "barrage initialized"
    );

    INIT_STATE
        .set(InitState { config })
        .map_err(|_| anyhow!("Initialization already completed"))?;

    Ok(())
}

pub fn is_initialized() -> bool {
    INIT_STATE.get().is_some()
}

/// The configuration loaded by [`initialize`], if it has run
pub fn config() -> Option<&'static Config> {
    INIT_STATE.get().map(|state| &state.config)
}
