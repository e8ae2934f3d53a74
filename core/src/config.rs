//! Engine configuration
//!
//! Sources are layered, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`BARRAGE_CONFIG_PATH`, or an explicit path)
//! 3. `BARRAGE_*` environment variables, `__` separating nested keys
//!    (`BARRAGE_ENGINE__TARGET=http://localhost:8080`)
//! 4. builder overrides
//!
//! A `.env` file in the working directory is loaded first, if present.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::template::DEFAULT_MAX_DEPTH;

pub const CONFIG_PATH_ENV: &str = "BARRAGE_CONFIG_PATH";
const ENV_PREFIX: &str = "BARRAGE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

/// Settings the interpreter consults while running scenarios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Base URL prefixed to request URIs starting with `/`
    pub target: Option<String>,

    /// Headers added to every request unless the step sets them
    pub default_headers: BTreeMap<String, String>,

    /// Bound on nested template resolution passes
    pub max_template_depth: usize,

    /// Multiplier applied to `think` pauses (0 disables them)
    pub think_scale: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            target: None,
            default_headers: BTreeMap::new(),
            max_template_depth: DEFAULT_MAX_DEPTH,
            think_scale: 1.0,
        }
    }
}

impl EngineSettings {
    /// Prefix `uri` with the target when it is a relative path
    pub fn resolve_uri(&self, uri: String) -> String {
        match &self.target {
            Some(target) if uri.starts_with('/') => {
                format!("{}{}", target.trim_end_matches('/'), uri)
            }
            _ => uri,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default sources
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse a TOML document, without consulting files or the environment
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_template_depth == 0 {
            anyhow::bail!("engine.max_template_depth must be at least 1");
        }

        if !self.engine.think_scale.is_finite() || self.engine.think_scale < 0.0 {
            anyhow::bail!(
                "engine.think_scale must be a non-negative number, got {}",
                self.engine.think_scale
            );
        }

        if let Some(target) = &self.engine.target {
            if !(target.starts_with("http://") || target.starts_with("https://")) {
                anyhow::bail!("engine.target must be an http(s) URL, got `{}`", target);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    target: Option<String>,
    log_filter: Option<String>,
    skip_env: bool,
}

impl ConfigBuilder {
    /// Read this file instead of `BARRAGE_CONFIG_PATH`
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Ignore `.env` and `BARRAGE_*` variables
    pub fn skip_env(mut self, skip: bool) -> Self {
        self.skip_env = skip;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_env {
            // A missing .env file is fine
            let _ = dotenvy::dotenv();
        }

        let path = self.config_path.or_else(|| {
            if self.skip_env {
                None
            } else {
                std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
            }
        });

        let mut builder = config::Config::builder();

        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let mut config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(target) = self.target {
            config.engine.target = Some(target);
        }
        if let Some(filter) = self.log_filter {
            config.logging.filter = filter;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = Config::builder().skip_env(true).build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.max_template_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            target = "http://localhost:8888"
            think_scale = 0.0

            [engine.default_headers]
            user-agent = "barrage"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.target.as_deref(), Some("http://localhost:8888"));
        assert_eq!(config.engine.think_scale, 0.0);
        assert_eq!(
            config.engine.default_headers.get("user-agent").map(String::as_str),
            Some("barrage")
        );
        assert_eq!(config.engine.max_template_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_file_source_and_overrides() {
        let dir = std::env::temp_dir().join(format!("barrage-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("barrage.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[engine]\nmax_template_depth = 3\n[logging]\nfilter = \"debug\"").unwrap();

        let config = Config::builder()
            .skip_env(true)
            .config_path(Some(path))
            .target("https://example.test")
            .build()
            .unwrap();

        assert_eq!(config.engine.max_template_depth, 3);
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.engine.target.as_deref(), Some("https://example.test"));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert_err!(Config::builder()
            .skip_env(true)
            .config_path(Some(PathBuf::from("/nonexistent/barrage.toml")))
            .build());
    }

    #[test]
    fn test_validation() {
        assert_err!(Config::from_toml_str("[engine]\nmax_template_depth = 0"));
        assert_err!(Config::from_toml_str("[engine]\nthink_scale = -1.0"));
        assert_err!(Config::from_toml_str("[engine]\ntarget = \"localhost\""));
        assert_ok!(Config::from_toml_str("[engine]\ntarget = \"https://host\""));
    }

    #[test]
    fn test_resolve_uri() {
        let mut settings = EngineSettings::default();
        assert_eq!(settings.resolve_uri("/a".to_string()), "/a");

        settings.target = Some("http://host:1/".to_string());
        assert_eq!(settings.resolve_uri("/a".to_string()), "http://host:1/a");
        assert_eq!(
            settings.resolve_uri("https://other/b".to_string()),
            "https://other/b"
        );
    }
}
