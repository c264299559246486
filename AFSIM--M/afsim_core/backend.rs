use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::{process::Command, time::timeout};

use crate::{config::ENV_AFSIM_HOME, helper::ServiceTelemetry};

/// Default timeout for attached tool runs.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(3600);
const MAX_STDOUT_CHARS: usize = 4000;
const MAX_STDERR_CHARS: usize = 2000;

/// The four AFSIM executables the server knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfsimTool {
    /// Scenario builder GUI.
    Wizard,
    /// Mission planner.
    Mission,
    /// Batch runner.
    Warlock,
    /// Post-processor.
    Mystic,
}

impl AfsimTool {
    /// Every known tool.
    pub const ALL: [Self; 4] = [Self::Wizard, Self::Mission, Self::Warlock, Self::Mystic];

    /// Short key (`wizard`).
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Wizard => "wizard",
            Self::Mission => "mission",
            Self::Warlock => "warlock",
            Self::Mystic => "mystic",
        }
    }

    /// Executable name (`wsf_wizard`).
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::Wizard => "wsf_wizard",
            Self::Mission => "wsf_mission",
            Self::Warlock => "wsf_warlock",
            Self::Mystic => "wsf_mystic",
        }
    }

    /// Case-insensitive lookup by key.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.key().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for AfsimTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Maps a tool key to an executable on disk.
pub trait BinaryResolver: Send + Sync {
    /// Resolved path, or `None` when the tool cannot be found.
    fn resolve(&self, tool_key: &str) -> Option<PathBuf>;
}

/// Result of [`AfsimBackend::detect_installation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationReport {
    /// Installation root in effect.
    pub afsim_home: Option<String>,
    /// Resolved path per tool key.
    pub binaries: IndexMap<String, Option<String>>,
    /// Whether every tool resolved.
    pub all_found: bool,
}

/// Outcome of a tool launch. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Launched (detached) or exited with status 0 (attached).
    pub success: bool,
    /// Tool key.
    pub tool: String,
    /// Pid of a detached launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Exit code of an attached run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    /// Tail of stdout.
    #[serde(default)]
    pub stdout: String,
    /// Tail of stderr.
    #[serde(default)]
    pub stderr: String,
    /// Full command line.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    fn failure(tool: &str, cmd: Vec<String>, error: String) -> Self {
        Self {
            tool: tool.to_owned(),
            cmd,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Binary discovery and execution of the AFSIM tool suite.
#[derive(Debug)]
pub struct AfsimBackend {
    home: RwLock<Option<PathBuf>>,
    overrides: RwLock<IndexMap<String, PathBuf>>,
    timeout: Duration,
    telemetry: Option<ServiceTelemetry>,
}

impl Default for AfsimBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AfsimBackend {
    /// Creates a backend, optionally rooted at an installation directory.
    #[must_use]
    pub fn new(home: Option<PathBuf>) -> Self {
        Self {
            home: RwLock::new(home),
            overrides: RwLock::new(IndexMap::new()),
            timeout: DEFAULT_TOOL_TIMEOUT,
            telemetry: None,
        }
    }

    /// Timeout for attached runs.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets the installation root.
    pub fn set_afsim_home(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.log(
            LogLevel::Info,
            "backend.home.set",
            json!({ "afsim_home": path.display().to_string() }),
        );
        *self.home.write() = Some(path);
    }

    /// Installation root, if any.
    #[must_use]
    pub fn afsim_home(&self) -> Option<PathBuf> {
        self.home.read().clone()
    }

    /// Pins a tool key (or any binary name) to an explicit path.
    pub fn set_binary_path(&self, tool: &str, path: impl Into<PathBuf>) {
        let key = tool.trim().to_ascii_lowercase();
        let path = path.into();
        self.log(
            LogLevel::Info,
            "backend.binary.set",
            json!({ "tool": key, "path": path.display().to_string() }),
        );
        self.overrides.write().insert(key, path);
    }

    /// Resolved path for each known tool.
    #[must_use]
    pub fn list_binary_paths(&self) -> IndexMap<String, Option<String>> {
        AfsimTool::ALL
            .into_iter()
            .map(|tool| {
                let path = self.resolve(tool.key()).map(|p| p.display().to_string());
                (tool.key().to_owned(), path)
            })
            .collect()
    }

    /// Adopts `AFSIM_HOME` when no home is set and reports what resolves.
    #[must_use]
    pub fn detect_installation(&self) -> InstallationReport {
        self.detect_installation_with(std::env::var(ENV_AFSIM_HOME).ok())
    }

    /// [`Self::detect_installation`] with an explicit environment value.
    #[must_use]
    pub fn detect_installation_with(&self, env_home: Option<String>) -> InstallationReport {
        let env_home = env_home.filter(|home| !home.trim().is_empty());
        if let Some(home) = &env_home {
            let mut current = self.home.write();
            if current.is_none() {
                *current = Some(PathBuf::from(home));
            }
        }
        let binaries = self.list_binary_paths();
        let all_found = binaries.values().all(Option::is_some);
        let afsim_home = self
            .afsim_home()
            .map(|home| home.display().to_string())
            .or(env_home);
        self.log(
            LogLevel::Info,
            "backend.detected",
            json!({ "afsim_home": afsim_home, "all_found": all_found }),
        );
        InstallationReport {
            afsim_home,
            binaries,
            all_found,
        }
    }

    /// Launches a tool.
    ///
    /// Detached launches discard output and report the pid. Attached runs
    /// wait up to the configured timeout and keep the tail of the output.
    pub async fn run_tool(
        &self,
        tool: &str,
        primary_arg: Option<&str>,
        extra_args: &[String],
        detach: bool,
    ) -> ToolOutcome {
        let Some(binary) = self.resolve(tool) else {
            let message =
                format!("AFSIM tool '{tool}' not found. Set AFSIM_HOME or use set_binary_path().");
            self.log(LogLevel::Error, "backend.tool.missing", json!({ "tool": tool }));
            return ToolOutcome::failure(tool, Vec::new(), message);
        };
        let mut cmd = vec![binary.display().to_string()];
        cmd.extend(primary_arg.filter(|arg| !arg.is_empty()).map(str::to_owned));
        cmd.extend(extra_args.iter().cloned());

        let mut command = Command::new(&binary);
        command.args(&cmd[1..]).stdin(Stdio::null());
        self.log(
            LogLevel::Info,
            "backend.tool.launch",
            json!({ "tool": tool, "cmd": cmd, "detach": detach }),
        );

        let outcome = if detach {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            match command.spawn() {
                Ok(child) => ToolOutcome {
                    success: true,
                    tool: tool.to_owned(),
                    pid: child.id(),
                    cmd,
                    ..ToolOutcome::default()
                },
                Err(err) => ToolOutcome::failure(tool, cmd, spawn_error(&binary, &err)),
            }
        } else {
            command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            match command.spawn() {
                Err(err) => ToolOutcome::failure(tool, cmd, spawn_error(&binary, &err)),
                Ok(child) => match timeout(self.timeout, child.wait_with_output()).await {
                    Ok(Ok(output)) => ToolOutcome {
                        success: output.status.success(),
                        tool: tool.to_owned(),
                        returncode: output.status.code(),
                        stdout: tail_chars(&String::from_utf8_lossy(&output.stdout), MAX_STDOUT_CHARS),
                        stderr: tail_chars(&String::from_utf8_lossy(&output.stderr), MAX_STDERR_CHARS),
                        cmd,
                        ..ToolOutcome::default()
                    },
                    Ok(Err(err)) => ToolOutcome::failure(tool, cmd, err.to_string()),
                    Err(_) => ToolOutcome::failure(tool, cmd, format!("Tool '{tool}' timed out.")),
                },
            }
        };
        if let Some(error) = &outcome.error {
            self.log(
                LogLevel::Error,
                "backend.tool.failed",
                json!({ "tool": tool, "error": error }),
            );
        }
        outcome
    }

    /// Launches `wsf_wizard`.
    pub async fn run_wizard(&self, scenario: Option<&str>, extra_args: &[String], detach: bool) -> ToolOutcome {
        self.run_tool(AfsimTool::Wizard.key(), scenario, extra_args, detach)
            .await
    }

    /// Launches `wsf_mission`.
    pub async fn run_mission(&self, scenario: Option<&str>, extra_args: &[String], detach: bool) -> ToolOutcome {
        self.run_tool(AfsimTool::Mission.key(), scenario, extra_args, detach)
            .await
    }

    /// Runs `wsf_warlock` in batch mode, writing into `output_dir`.
    pub async fn run_warlock(&self, scenario: &str, output_dir: &str, extra_args: &[String]) -> ToolOutcome {
        let mut args = vec!["-o".to_owned(), output_dir.to_owned()];
        args.extend(extra_args.iter().cloned());
        self.run_tool(AfsimTool::Warlock.key(), Some(scenario), &args, false)
            .await
    }

    /// Launches `wsf_mystic` on a results directory.
    pub async fn run_mystic(&self, results_dir: &str, extra_args: &[String], detach: bool) -> ToolOutcome {
        self.run_tool(AfsimTool::Mystic.key(), Some(results_dir), extra_args, detach)
            .await
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

/// Override, then `<home>/bin/<binary>`, then `PATH`.
impl BinaryResolver for AfsimBackend {
    fn resolve(&self, tool_key: &str) -> Option<PathBuf> {
        let key = tool_key.trim().to_ascii_lowercase();
        if let Some(path) = self.overrides.read().get(&key) {
            return Some(path.clone());
        }
        let canonical = AfsimTool::parse(&key)
            .map(AfsimTool::binary_name)
            .unwrap_or(key.as_str());
        if let Some(home) = self.home.read().as_deref() {
            let candidate = home.join("bin").join(canonical);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        which::which(canonical).ok()
    }
}

fn spawn_error(binary: &Path, err: &std::io::Error) -> String {
    if err.kind() == std::io::ErrorKind::NotFound {
        format!("Binary not found at '{}'.", binary.display())
    } else {
        err.to_string()
    }
}

/// Keeps the last `max` characters.
fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_owned()
    } else {
        text.chars().skip(count - max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn tool_keys_map_to_binaries() {
        assert_eq!(AfsimTool::parse("Warlock"), Some(AfsimTool::Warlock));
        assert_eq!(AfsimTool::Mystic.binary_name(), "wsf_mystic");
        assert!(AfsimTool::parse("unknown").is_none());
    }

    #[test]
    fn override_beats_home_which_beats_nothing() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("wsf_mission"), "").unwrap();

        let backend = AfsimBackend::new(Some(dir.path().to_path_buf()));
        assert_eq!(backend.resolve("mission"), Some(bin.join("wsf_mission")));
        backend.set_binary_path("MISSION", "/opt/custom/mission");
        assert_eq!(
            backend.resolve("mission"),
            Some(PathBuf::from("/opt/custom/mission"))
        );
        assert!(backend.resolve("no_such_afsim_tool_xyz").is_none());
    }

    #[test]
    fn detection_adopts_env_home_once() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        for tool in AfsimTool::ALL {
            fs::write(bin.join(tool.binary_name()), "").unwrap();
        }
        let backend = AfsimBackend::default();
        let report = backend.detect_installation_with(Some(dir.path().display().to_string()));
        assert!(report.all_found);
        assert_eq!(report.binaries.len(), 4);
        assert_eq!(backend.afsim_home(), Some(dir.path().to_path_buf()));

        backend.set_afsim_home("/elsewhere");
        let again = backend.detect_installation_with(Some(dir.path().display().to_string()));
        assert_eq!(again.afsim_home.as_deref(), Some("/elsewhere"));
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn missing_tool_is_reported_not_raised() {
        let backend = AfsimBackend::default();
        backend.set_binary_path("mystic", "/definitely/not/here/wsf_mystic");
        let outcome = backend.run_mystic("/tmp", &[], false).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));

        let unresolved = backend.run_tool("no_such_afsim_tool_xyz", None, &[], true).await;
        assert!(!unresolved.success);
        assert!(unresolved.cmd.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attached_run_captures_output() {
        let backend = AfsimBackend::default();
        backend.set_binary_path("warlock", "/bin/sh");
        let outcome = backend
            .run_tool("warlock", Some("-c"), &["echo ran; echo oops 1>&2; exit 3".to_owned()], false)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.returncode, Some(3));
        assert_eq!(outcome.stdout.trim(), "ran");
        assert_eq!(outcome.stderr.trim(), "oops");
        assert_eq!(outcome.cmd[0], "/bin/sh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attached_run_times_out() {
        let backend = AfsimBackend::default().with_timeout(Duration::from_millis(200));
        backend.set_binary_path("mission", "/bin/sh");
        let outcome = backend
            .run_tool("mission", Some("-c"), &["sleep 5".to_owned()], false)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_run_reports_pid() {
        let backend = AfsimBackend::default();
        backend.set_binary_path("wizard", "/bin/sh");
        let outcome = backend
            .run_wizard(Some("-c"), &["exit 0".to_owned()], true)
            .await;
        assert!(outcome.success);
        assert!(outcome.pid.is_some());
    }
}
