use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommError;

/// Upper bound on the dispatch idle sleep. Anything longer defeats the
/// point of busy-polling the admission queue.
const MAX_IDLE_SLEEP_US: u64 = 1000;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

/// Runtime configuration, parsed from TOML with env overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub handles: HandleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CommError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| CommError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CommError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CommError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, CommError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `CONFLUENCE_SECTION_KEY` overrides `section.key`.
    /// - `CONFLUENCE_DISPATCH_IDLE_SLEEP_US` -> `dispatch.idle_sleep_us`
    /// - `CONFLUENCE_DISPATCH_THREAD_NAME` -> `dispatch.thread_name`
    /// - `CONFLUENCE_DISPATCH_INIT_TIMEOUT_MS` -> `dispatch.init_timeout_ms`
    /// - `CONFLUENCE_HANDLES_WAIT_POLL_MS` -> `handles.wait_poll_ms`
    /// - `CONFLUENCE_LOG_FILTER` -> `logging.filter`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("CONFLUENCE_DISPATCH_IDLE_SLEEP_US") {
            self.dispatch.idle_sleep_us = v;
        }
        if let Some(v) = env_opt("CONFLUENCE_DISPATCH_THREAD_NAME") {
            self.dispatch.thread_name = v;
        }
        if let Some(v) = env_parse("CONFLUENCE_DISPATCH_INIT_TIMEOUT_MS") {
            self.dispatch.init_timeout_ms = v;
        }
        if let Some(v) = env_parse("CONFLUENCE_HANDLES_WAIT_POLL_MS") {
            self.handles.wait_poll_ms = v;
        }
        if let Some(v) = env_opt("CONFLUENCE_LOG_FILTER") {
            self.logging.filter = v;
        }
    }

    pub fn validate(&self) -> Result<(), CommError> {
        if self.dispatch.thread_name.trim().is_empty() {
            return Err(CommError::Config("dispatch.thread_name must not be empty".into()));
        }
        if self.dispatch.idle_sleep_us > MAX_IDLE_SLEEP_US {
            return Err(CommError::Config(format!(
                "dispatch.idle_sleep_us is {}, must be at most {MAX_IDLE_SLEEP_US}",
                self.dispatch.idle_sleep_us
            )));
        }
        if self.dispatch.init_timeout_ms == 0 {
            return Err(CommError::Config("dispatch.init_timeout_ms must be positive".into()));
        }
        if self.handles.wait_poll_ms == 0 {
            return Err(CommError::Config("handles.wait_poll_ms must be positive".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Runtime config:");
        tracing::info!(
            "  dispatch:  thread={}, idle_sleep={}us, init_timeout={}ms",
            self.dispatch.thread_name,
            self.dispatch.idle_sleep_us,
            self.dispatch.init_timeout_ms
        );
        tracing::info!("  handles:   wait_poll={}ms", self.handles.wait_poll_ms);
        tracing::info!("  logging:   filter={}", self.logging.filter);
    }
}

// ── Dispatch ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Sleep between polls of an empty admission queue, in microseconds.
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,
    /// Name of the dispatch thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// How long `start` waits for the substrate to initialize.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

fn default_idle_sleep_us() -> u64 { 1 }
fn default_thread_name() -> String { "confluence-dispatch".into() }
fn default_init_timeout_ms() -> u64 { 30_000 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_sleep_us: default_idle_sleep_us(),
            thread_name: default_thread_name(),
            init_timeout_ms: default_init_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

// ── Handles ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Poll interval used by blocking waits on a handle, in milliseconds.
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
}

fn default_wait_poll_ms() -> u64 { 1 }

impl Default for HandleConfig {
    fn default() -> Self {
        Self { wait_poll_ms: default_wait_poll_ms() }
    }
}

impl HandleConfig {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}
