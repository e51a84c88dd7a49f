use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::watcher::{DetectionMode, TargetKind};

/// Top-level configuration loaded from promptrun.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub watcher: WatcherSettings,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program name resolved on PATH (e.g. `agent`).
    pub command: String,
    /// Shell used to launch the agent. Falls back to `$SHELL`, then `/bin/bash`
    /// (`cmd.exe` on Windows).
    pub shell: Option<String>,
    pub prompt_delay_ms: u64,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_ms: u64,
    pub max_duration_secs: u64,
    pub tolerance_ms: u64,
    /// Scanned in `new-files` mode when the task id is not recognized.
    pub fallback_dirs: Vec<PathBuf>,
}

/// A task's completion-detection rules, as written in `[[tasks]]`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub id: String,
    pub mode: DetectionMode,
    #[serde(default)]
    pub correlate: bool,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub path: PathBuf,
    pub kind: TargetKind,
}

/// Errors produced while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file yields the defaults; a file that
    /// exists but can't be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl AgentConfig {
    pub fn prompt_delay(&self) -> Duration {
        Duration::from_millis(self.prompt_delay_ms)
    }

    /// The shell the agent is launched through on this platform.
    pub fn resolved_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            "cmd.exe".to_string()
        } else {
            std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/bash".to_string())
        }
    }
}

impl WatcherSettings {
    /// Never zero; the poll timer rejects a zero period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

// --- Default implementations ---

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "agent".to_string(),
            shell: None,
            prompt_delay_ms: 1000,
            rows: 40,
            cols: 120,
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            max_duration_secs: 600,
            tolerance_ms: 50,
            fallback_dirs: vec![
                PathBuf::from(".reviews"),
                PathBuf::from(".plans"),
                PathBuf::from(".reports"),
            ],
        }
    }
}
