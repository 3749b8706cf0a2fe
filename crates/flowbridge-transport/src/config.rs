//! Transport configuration – read from `flowbridge.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working configuration.
//!
//! ```toml
//! hostname = "rig-01"
//! worker_thread = "flowbridge-publish"
//! publish_failure_log_per_sec = 1
//! bus_dispatch_threads = 2
//! publish_buffer_capacity = 64
//! ```

use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use flowbridge_types::{BusError, TransportError};
use serde::{Deserialize, Serialize};

use crate::in_process::InProcessBus;
use crate::naming::TopicNamer;
use crate::factory::DEFAULT_PUBLISH_BUFFER;
use crate::worker::DEFAULT_THREAD_NAME;

/// Variable naming an explicit config file.
pub const CONFIG_PATH_VAR: &str = "FLOWBRIDGE_CONFIG";

/// Settings shared by every transport of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Host segment of default topic names.  Detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Name of the publish worker thread.
    #[serde(default = "default_worker_thread")]
    pub worker_thread: String,

    /// Upper bound on publish-failure warnings per second and element.
    #[serde(default = "default_failure_log_per_sec")]
    pub publish_failure_log_per_sec: u32,

    /// Callback threads of an [`InProcessBus`] built from this config.
    #[serde(default = "default_dispatch_threads")]
    pub bus_dispatch_threads: usize,

    /// Minimum size of the buffer in front of each publisher.  Independent
    /// of the policy's bus queue depth.
    #[serde(default = "default_publish_buffer_capacity")]
    pub publish_buffer_capacity: usize,
}

fn default_worker_thread() -> String {
    DEFAULT_THREAD_NAME.to_string()
}
fn default_failure_log_per_sec() -> u32 {
    1
}
fn default_dispatch_threads() -> usize {
    2
}
fn default_publish_buffer_capacity() -> usize {
    DEFAULT_PUBLISH_BUFFER
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            worker_thread: default_worker_thread(),
            publish_failure_log_per_sec: default_failure_log_per_sec(),
            bus_dispatch_threads: default_dispatch_threads(),
            publish_buffer_capacity: default_publish_buffer_capacity(),
        }
    }
}

impl TransportConfig {
    /// Parse a TOML document.  Environment overrides are not applied.
    pub fn from_toml_str(raw: &str) -> Result<Self, TransportError> {
        toml::from_str(raw).map_err(|e| TransportError::Config(format!("Failed to parse config: {e}")))
    }

    /// Failure-log rate, never zero.
    pub fn failure_log_rate(&self) -> NonZeroU32 {
        NonZeroU32::new(self.publish_failure_log_per_sec).unwrap_or(NonZeroU32::MIN)
    }

    /// Naming identity: this process, with the configured host if any.
    pub fn namer(&self) -> TopicNamer {
        let namer = TopicNamer::from_system();
        match self.hostname.as_deref().filter(|h| !h.is_empty()) {
            Some(hostname) => namer.with_hostname(hostname),
            None => namer,
        }
    }

    /// Build an [`InProcessBus`] sized by this config.
    pub fn in_process_bus(&self) -> Result<InProcessBus, BusError> {
        InProcessBus::with_dispatch_threads(self.bus_dispatch_threads)
    }
}

/// Config file location: `$FLOWBRIDGE_CONFIG`, else `./flowbridge.toml`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("flowbridge.toml"))
}

/// Load the config from [`config_path`], falling back to defaults when the
/// file does not exist.  Environment overrides are always applied.
pub fn load() -> Result<TransportConfig, TransportError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<TransportConfig>, TransportError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TransportError::Config(format!("Failed to read config at {}: {}", path.display(), e))
    })?;
    TransportConfig::from_toml_str(&raw).map(Some)
}

/// Apply `FLOWBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLOWBRIDGE_HOSTNAME` | `hostname` |
/// | `FLOWBRIDGE_WORKER_THREAD` | `worker_thread` |
/// | `FLOWBRIDGE_FAILURE_LOG_PER_SEC` | `publish_failure_log_per_sec` |
pub fn apply_env_overrides(cfg: &mut TransportConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an arbitrary variable source.
/// Extracted for testability without mutating the environment.
pub(crate) fn apply_overrides(cfg: &mut TransportConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("FLOWBRIDGE_HOSTNAME") {
        cfg.hostname = Some(v);
    }
    if let Some(v) = lookup("FLOWBRIDGE_WORKER_THREAD") {
        cfg.worker_thread = v;
    }
    if let Some(v) = lookup("FLOWBRIDGE_FAILURE_LOG_PER_SEC")
        && let Ok(rate) = v.parse::<u32>()
    {
        cfg.publish_failure_log_per_sec = rate;
    }
}
