use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

/// Environment variable overriding [`ServerConfig::state_dir`].
pub const ENV_STATE_DIR: &str = "AFSIM_MCP_STATE_DIR";
/// Environment variable naming the AFSIM installation root.
pub const ENV_AFSIM_HOME: &str = "AFSIM_HOME";
/// Environment variable naming the mission executable.
pub const ENV_AFSIM_BINARY: &str = "AFSIM_BINARY";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "AFSIM_MCP_LOG_LEVEL";

/// Server configuration, usually read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root directory for scenarios and run outputs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Scenario directory; `<state_dir>/scenarios` when unset.
    #[serde(default)]
    pub scenarios_dir: Option<PathBuf>,
    /// Run output root; `<state_dir>/runs` when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Executable launched by `run_simulation`.
    #[serde(default)]
    pub afsim_binary: Option<PathBuf>,
    /// AFSIM installation root used for binary discovery.
    #[serde(default)]
    pub afsim_home: Option<PathBuf>,
    /// Timeout for attached tool executions.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional JSON-lines file receiving lifecycle events.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

/// `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level (`debug`, `info`, `warn`, `error`).
    #[serde(default = "default_level")]
    pub level: String,
    /// Log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            scenarios_dir: None,
            output_dir: None,
            afsim_binary: None,
            afsim_home: None,
            tool_timeout_secs: default_tool_timeout(),
            logging: LoggingConfig::default(),
            event_log: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// Relative paths are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading server config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config
            .log_level()
            .with_context(|| format!("invalid [logging] level in {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.rebase(&base);
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |candidate: &mut PathBuf| {
            if candidate.is_relative() {
                *candidate = base.join(&*candidate);
            }
        };
        join(&mut self.state_dir);
        for slot in [
            &mut self.scenarios_dir,
            &mut self.output_dir,
            &mut self.logging.file,
            &mut self.event_log,
        ] {
            if let Some(candidate) = slot.as_mut() {
                join(candidate);
            }
        }
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(dir) = get(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(home) = get(ENV_AFSIM_HOME) {
            self.afsim_home = Some(PathBuf::from(home));
        }
        if let Some(binary) = get(ENV_AFSIM_BINARY) {
            self.afsim_binary = Some(PathBuf::from(binary));
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            level
                .parse::<LogLevel>()
                .with_context(|| format!("{ENV_LOG_LEVEL}={level}"))?;
            self.logging.level = level;
        }
        Ok(())
    }

    /// Parsed minimum log level.
    pub fn log_level(&self) -> Result<LogLevel> {
        self.logging.level.parse()
    }

    /// Effective scenario directory.
    #[must_use]
    pub fn scenarios_dir(&self) -> PathBuf {
        self.scenarios_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("scenarios"))
    }

    /// Effective run output root.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("runs"))
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("mcp_state")
}

const fn default_tool_timeout() -> u64 {
    3600
}

fn default_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_derive_from_state_dir() {
        let config = ServerConfig::default();
        assert_eq!(config.scenarios_dir(), PathBuf::from("mcp_state/scenarios"));
        assert_eq!(config.output_dir(), PathBuf::from("mcp_state/runs"));
        assert_eq!(config.tool_timeout_secs, 3600);
        assert_eq!(config.log_level().unwrap(), LogLevel::Info);
    }

    #[test]
    fn loads_toml_and_rebases_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("afsim-mcp.toml");
        fs::write(
            &path,
            r#"
state_dir = "state"
afsim_binary = "/opt/afsim/bin/mission"
tool_timeout_secs = 60
event_log = "events.jsonl"

[logging]
level = "warn"
file = "logs/server.log"
"#,
        )
        .unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.state_dir, dir.path().join("state"));
        assert_eq!(config.scenarios_dir(), dir.path().join("state/scenarios"));
        assert_eq!(
            config.afsim_binary.as_deref(),
            Some(Path::new("/opt/afsim/bin/mission"))
        );
        assert_eq!(config.tool_timeout_secs, 60);
        assert_eq!(config.event_log, Some(dir.path().join("events.jsonl")));
        assert_eq!(config.logging.file, Some(dir.path().join("logs/server.log")));
        assert_eq!(config.log_level().unwrap(), LogLevel::Warn);
    }

    #[test]
    fn bad_level_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("loud"));
    }

    #[test]
    fn overrides_win_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            (ENV_STATE_DIR, "/tmp/afsim-state"),
            (ENV_AFSIM_HOME, "/opt/afsim"),
            (ENV_AFSIM_BINARY, " "),
            (ENV_LOG_LEVEL, "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/afsim-state"));
        assert_eq!(config.afsim_home, Some(PathBuf::from("/opt/afsim")));
        assert!(config.afsim_binary.is_none());
        assert_eq!(config.log_level().unwrap(), LogLevel::Debug);
    }
}
