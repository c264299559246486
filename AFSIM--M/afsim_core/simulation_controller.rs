use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
    models::{SimulationRun, SimulationStatus},
    results::scan_result_files,
    scenario_manager::ScenarioManager,
};

/// File collecting stdout and stderr of a launched run.
pub const RUN_LOG_FILE: &str = "simulation.log";

struct RunEntry {
    run: SimulationRun,
    child: Option<Child>,
}

/// Launches the external simulator and tracks each run by polling.
///
/// Transitions: `idle -> running -> {completed, failed, stopped}`, or straight
/// from `idle` to `completed` (dry run) or `failed`. Terminal states are final.
pub struct SimulationController {
    scenarios: Arc<ScenarioManager>,
    runs: Mutex<IndexMap<String, RunEntry>>,
    executable: RwLock<Option<PathBuf>>,
    output_root: PathBuf,
    telemetry: Option<ServiceTelemetry>,
}

impl std::fmt::Debug for SimulationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationController")
            .field("output_root", &self.output_root)
            .field("executable", &*self.executable.read())
            .field("runs", &self.runs.lock().len())
            .finish_non_exhaustive()
    }
}

enum Transition {
    Started,
    Completed,
    Failed,
    Stopped,
}

impl Transition {
    const fn event_type(&self) -> &'static str {
        match self {
            Self::Started => "simulation.run.started",
            Self::Completed => "simulation.run.completed",
            Self::Failed => "simulation.run.failed",
            Self::Stopped => "simulation.run.stopped",
        }
    }

    const fn level(&self) -> LogLevel {
        match self {
            Self::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl SimulationController {
    /// Creates a controller writing run directories under `output_root`.
    pub fn new(scenarios: Arc<ScenarioManager>, output_root: impl Into<PathBuf>) -> Result<Self> {
        let output_root = output_root.into();
        fs::create_dir_all(&output_root)?;
        Ok(Self {
            scenarios,
            runs: Mutex::new(IndexMap::new()),
            executable: RwLock::new(None),
            output_root,
            telemetry: None,
        })
    }

    /// Sets the initial executable.
    #[must_use]
    pub fn with_executable(self, executable: Option<PathBuf>) -> Self {
        *self.executable.write() = executable;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Root under which each run gets its own directory.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Sets the executable; an empty string clears it.
    pub fn set_executable(&self, path: &str) {
        let trimmed = path.trim();
        let next = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
        self.log(
            LogLevel::Info,
            "simulation.executable.set",
            json!({ "path": trimmed }),
        );
        *self.executable.write() = next;
    }

    /// Currently configured executable.
    #[must_use]
    pub fn get_executable(&self) -> Option<PathBuf> {
        self.executable.read().clone()
    }

    /// Saves the scenario text and launches a run.
    ///
    /// Only an unknown scenario or a failed save is returned as an error;
    /// launch problems end up in a `failed` run record.
    pub fn run(&self, scenario_id: &str, extra_args: &[String], dry_run: bool) -> Result<SimulationRun> {
        let scenario_name = self
            .scenarios
            .with_scenario(scenario_id, |scenario| scenario.name.clone())?;
        let scenario_file = self.scenarios.save_text(scenario_id, None)?;

        let mut run = SimulationRun::new(&scenario_name, scenario_file.display().to_string());
        let output_dir = self
            .output_root
            .join(format!("{scenario_name}-{}", run.run_id));
        run.output_dir = output_dir.display().to_string();

        let executable = self.get_executable().filter(|_| !dry_run);
        let (child, transition) = if let Err(err) = fs::create_dir_all(&output_dir) {
            Self::fail(&mut run, err.to_string())
        } else {
            match executable {
                None => {
                    let now = Utc::now();
                    run.status = SimulationStatus::Completed;
                    run.start_time = Some(now);
                    run.end_time = Some(now);
                    (None, Transition::Completed)
                }
                Some(exe) if !exe.exists() => {
                    Self::fail(&mut run, format!("AFSIM binary not found: {}", exe.display()))
                }
                Some(exe) => match Self::spawn(&exe, &scenario_file, extra_args, &output_dir) {
                    Ok(child) => {
                        run.status = SimulationStatus::Running;
                        run.start_time = Some(Utc::now());
                        run.pid = Some(child.id());
                        run.log_file = output_dir.join(RUN_LOG_FILE).display().to_string();
                        (Some(child), Transition::Started)
                    }
                    Err(err) => Self::fail(&mut run, err.to_string()),
                },
            }
        };

        self.runs.lock().insert(
            run.run_id.clone(),
            RunEntry {
                run: run.clone(),
                child,
            },
        );
        self.announce(&transition, &run, json!({ "dry_run": dry_run, "args": extra_args }));
        Ok(run)
    }

    fn fail(run: &mut SimulationRun, message: String) -> (Option<Child>, Transition) {
        run.status = SimulationStatus::Failed;
        run.error_message = message;
        (None, Transition::Failed)
    }

    fn spawn(exe: &Path, scenario_file: &Path, extra_args: &[String], output_dir: &Path) -> io::Result<Child> {
        // The child runs inside the output directory.
        let scenario_file = fs::canonicalize(scenario_file)?;
        let log = File::create(output_dir.join(RUN_LOG_FILE))?;
        let log_err = log.try_clone()?;
        Command::new(exe)
            .arg(&scenario_file)
            .args(extra_args)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
    }

    /// Returns the run, first probing a running child without affecting it.
    pub fn status(&self, run_id: &str) -> Result<SimulationRun> {
        let (run, finished) = {
            let mut runs = self.runs.lock();
            let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
            let finished = Self::reap_if_exited(entry);
            (entry.run.clone(), finished)
        };
        if finished {
            self.announce(&Transition::Completed, &run, json!({}));
        }
        Ok(run)
    }

    /// Terminates a running run. Runs in any other state are returned unchanged.
    pub fn stop(&self, run_id: &str) -> Result<SimulationRun> {
        let (run, transition) = {
            let mut runs = self.runs.lock();
            let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
            if entry.run.status != SimulationStatus::Running {
                return Ok(entry.run.clone());
            }
            let transition = if Self::reap_if_exited(entry) {
                Transition::Completed
            } else if let Some(mut child) = entry.child.take() {
                match terminate(&mut child) {
                    Ok(()) => {
                        entry.run.status = SimulationStatus::Stopped;
                        entry.run.end_time = Some(Utc::now());
                        // Reap in the background so the child does not linger as a zombie.
                        std::thread::spawn(move || {
                            let _ = child.wait();
                        });
                        Transition::Stopped
                    }
                    Err(err) if process_vanished(&err) => {
                        let _ = child.try_wait();
                        Self::complete(&mut entry.run);
                        Transition::Completed
                    }
                    Err(err) => {
                        entry.child = Some(child);
                        return Err(AfsimError::ExecutionFailure(format!(
                            "failed to signal run '{run_id}': {err}"
                        )));
                    }
                }
            } else {
                entry.run.status = SimulationStatus::Stopped;
                entry.run.end_time = Some(Utc::now());
                Transition::Stopped
            };
            (entry.run.clone(), transition)
        };
        self.announce(&transition, &run, json!({}));
        Ok(run)
    }

    /// All runs in creation order, without probing.
    #[must_use]
    pub fn list(&self) -> Vec<SimulationRun> {
        self.runs
            .lock()
            .values()
            .map(|entry| entry.run.clone())
            .collect()
    }

    /// Polls a running child; `true` when it has just been observed to exit.
    fn reap_if_exited(entry: &mut RunEntry) -> bool {
        if entry.run.status != SimulationStatus::Running {
            return false;
        }
        let Some(child) = entry.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(_)) => {
                entry.child = None;
                Self::complete(&mut entry.run);
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    fn complete(run: &mut SimulationRun) {
        run.status = SimulationStatus::Completed;
        run.end_time = Some(Utc::now());
        run.result_files = scan_result_files(Path::new(&run.output_dir))
            .into_iter()
            .map(|path| path.display().to_string())
            .collect();
    }

    fn announce(&self, transition: &Transition, run: &SimulationRun, extra: Value) {
        let Some(tel) = &self.telemetry else {
            return;
        };
        let mut payload = json!({
            "run_id": run.run_id,
            "scenario_name": run.scenario_name,
            "status": run.status,
            "pid": run.pid,
            "output_dir": run.output_dir,
            "error_message": run.error_message,
        });
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            target.extend(extra);
        }
        let _ = tel.log(transition.level(), transition.event_type(), payload.clone());
        let _ = tel.event(transition.event_type(), payload);
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn run_not_found(run_id: &str) -> AfsimError {
    AfsimError::NotFound(format!("Simulation run '{run_id}' not found."))
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn process_vanished(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_vanished(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use shared_event_bus::MemoryEventBus;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<ScenarioManager>, SimulationController) {
        let dir = tempdir().unwrap();
        let scenarios = Arc::new(ScenarioManager::new(dir.path().join("scenarios")).unwrap());
        let controller =
            SimulationController::new(Arc::clone(&scenarios), dir.path().join("runs")).unwrap();
        (dir, scenarios, controller)
    }

    #[test]
    fn dry_run_completes_immediately() {
        let (_dir, scenarios, controller) = setup();
        let id = scenarios.create("alpha", "", None, None).unwrap().scenario_id;
        let run = controller.run(&id, &[], true).unwrap();
        assert_eq!(run.status, SimulationStatus::Completed);
        assert!(run.start_time.is_some());
        assert_eq!(run.start_time, run.end_time);
        assert!(run.pid.is_none());
        assert!(Path::new(&run.scenario_file).exists());
        assert!(run.output_dir.ends_with(&format!("alpha-{}", run.run_id)));
        assert!(Path::new(&run.output_dir).is_dir());
    }

    #[test]
    fn unconfigured_executable_behaves_like_dry_run() {
        let (_dir, scenarios, controller) = setup();
        let id = scenarios.create("alpha", "", None, None).unwrap().scenario_id;
        let run = controller.run(&id, &[], false).unwrap();
        assert_eq!(run.status, SimulationStatus::Completed);
        assert!(run.pid.is_none());
    }

    #[test]
    fn missing_binary_fails_without_pid() {
        let (dir, scenarios, controller) = setup();
        let id = scenarios.create("alpha", "", None, None).unwrap().scenario_id;
        let missing = dir.path().join("no/such/mission");
        controller.set_executable(&missing.display().to_string());
        let run = controller.run(&id, &[], false).unwrap();
        assert_eq!(run.status, SimulationStatus::Failed);
        assert!(run.error_message.contains("not found"));
        assert!(run.pid.is_none());
        assert_eq!(controller.list().len(), 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_dir, _scenarios, controller) = setup();
        assert_eq!(controller.run("nope", &[], true).unwrap_err().kind(), "not_found");
        assert_eq!(controller.status("nope").unwrap_err().kind(), "not_found");
        assert_eq!(controller.stop("nope").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn terminal_runs_ignore_stop() {
        let (_dir, scenarios, controller) = setup();
        let id = scenarios.create("alpha", "", None, None).unwrap().scenario_id;
        let run = controller.run(&id, &[], true).unwrap();
        let again = controller.stop(&run.run_id).unwrap();
        assert_eq!(again, run);
    }

    #[test]
    fn set_executable_empty_clears() {
        let (_dir, _scenarios, controller) = setup();
        controller.set_executable("/opt/afsim/bin/mission");
        assert_eq!(
            controller.get_executable(),
            Some(PathBuf::from("/opt/afsim/bin/mission"))
        );
        controller.set_executable("");
        assert!(controller.get_executable().is_none());
    }

    // `/bin/sh` stands in for the simulator: it reads the scenario file, skips
    // the `#` header and runs scenario parameters as commands.
    #[cfg(unix)]
    fn shell_scenario(scenarios: &ScenarioManager, name: &str, params: &[(&str, ParamValue)]) -> String {
        let id = scenarios.create(name, "", None, None).unwrap().scenario_id;
        scenarios
            .with_scenario_mut(&id, |scenario| {
                for (key, value) in params {
                    scenario.parameters.insert((*key).to_owned(), value.clone());
                }
            })
            .unwrap();
        id
    }

    #[cfg(unix)]
    #[test]
    fn finished_process_is_completed_with_results() {
        let (_dir, scenarios, controller) = setup();
        let bus = Arc::new(MemoryEventBus::new(16));
        let controller = controller.with_telemetry(
            ServiceTelemetry::builder("simulation-controller")
                .event_publisher(bus.clone())
                .build()
                .unwrap(),
        );
        controller.set_executable("/bin/sh");
        let id = shell_scenario(
            &scenarios,
            "quick",
            &[
                ("echo", ParamValue::from("hello-from-run")),
                ("touch", ParamValue::from("tracks.csv")),
            ],
        );
        let run = controller.run(&id, &[], false).unwrap();
        assert_eq!(run.status, SimulationStatus::Running);
        assert!(run.pid.is_some());

        let mut latest = run.clone();
        for _ in 0..200 {
            latest = controller.status(&run.run_id).unwrap();
            if latest.status != SimulationStatus::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        assert_eq!(latest.status, SimulationStatus::Completed);
        assert!(latest.end_time.is_some());
        assert!(latest.result_files.iter().any(|f| f.ends_with("tracks.csv")));
        let log = fs::read_to_string(&latest.log_file).unwrap();
        assert!(log.contains("hello-from-run"));
        assert_eq!(bus.events_of_type("simulation.run.started").len(), 1);
        assert_eq!(bus.events_of_type("simulation.run.completed").len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn stop_terminates_running_process() {
        let (_dir, scenarios, controller) = setup();
        controller.set_executable("/bin/sh");
        let id = shell_scenario(&scenarios, "slow", &[("sleep", ParamValue::Integer(5))]);
        let run = controller.run(&id, &[], false).unwrap();
        assert_eq!(run.status, SimulationStatus::Running);
        let stopped = controller.stop(&run.run_id).unwrap();
        assert_eq!(stopped.status, SimulationStatus::Stopped);
        assert!(stopped.end_time.is_some());
        assert_eq!(
            controller.status(&run.run_id).unwrap().status,
            SimulationStatus::Stopped
        );
    }

    #[cfg(unix)]
    #[test]
    fn stop_after_exit_reports_completed() {
        let (_dir, scenarios, controller) = setup();
        controller.set_executable("/bin/sh");
        let id = shell_scenario(&scenarios, "brief", &[("true", ParamValue::from(""))]);
        let run = controller.run(&id, &[], false).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        let outcome = controller.stop(&run.run_id).unwrap();
        assert_eq!(outcome.status, SimulationStatus::Completed);
    }
}
