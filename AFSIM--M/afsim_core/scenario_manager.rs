use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
    models::Scenario,
    params::{format_float, ParamValue},
};

/// Parameter key holding the verbatim text of a loaded `.afsim` file.
pub const RAW_CONTENT_KEY: &str = "raw_content";

/// Outcome of [`ScenarioManager::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// `true` when `errors` is empty.
    pub valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking remarks.
    pub warnings: Vec<String>,
}

/// Row returned by [`ScenarioManager::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    /// Registry identifier.
    pub scenario_id: String,
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Number of platforms.
    pub platform_count: usize,
    /// Simulated duration in seconds.
    pub duration_s: f64,
    /// Last known file.
    pub file_path: Option<String>,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(scenario: &Scenario) -> Self {
        Self {
            scenario_id: scenario.scenario_id.clone(),
            name: scenario.name.clone(),
            description: scenario.description.clone(),
            platform_count: scenario.platforms.len(),
            duration_s: scenario.duration_s,
            file_path: scenario.file_path.clone(),
        }
    }
}

/// In-memory scenario registry backed by a directory of persisted files.
#[derive(Debug)]
pub struct ScenarioManager {
    scenarios: RwLock<IndexMap<String, Scenario>>,
    scenarios_dir: PathBuf,
    telemetry: Option<ServiceTelemetry>,
}

impl ScenarioManager {
    /// Creates the manager, creating `scenarios_dir` if needed.
    pub fn new(scenarios_dir: impl Into<PathBuf>) -> Result<Self> {
        let scenarios_dir = scenarios_dir.into();
        fs::create_dir_all(&scenarios_dir)?;
        Ok(Self {
            scenarios: RwLock::new(IndexMap::new()),
            scenarios_dir,
            telemetry: None,
        })
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Directory used for default save locations.
    #[must_use]
    pub fn scenarios_dir(&self) -> &Path {
        &self.scenarios_dir
    }

    /// Creates and registers an empty scenario.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        duration_s: Option<f64>,
        time_step_s: Option<f64>,
    ) -> Result<Scenario> {
        if name.trim().is_empty() {
            return Err(AfsimError::InvalidArgument(
                "Scenario name must not be empty.".into(),
            ));
        }
        let mut scenario = Scenario::new(name);
        scenario.description = description.to_owned();
        if let Some(duration) = duration_s {
            scenario.duration_s = duration;
        }
        if let Some(step) = time_step_s {
            scenario.time_step_s = step;
        }
        self.log(
            LogLevel::Info,
            "scenario.created",
            json!({ "scenario_id": scenario.scenario_id, "name": scenario.name }),
        );
        self.register(scenario.clone());
        Ok(scenario)
    }

    /// Registers an `.afsim` file without parsing it.
    ///
    /// The text is kept verbatim under [`RAW_CONTENT_KEY`].
    pub fn load_text(&self, path: impl AsRef<Path>) -> Result<Scenario> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AfsimError::NotFound(format!(
                "Scenario file not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut scenario = Scenario::new(name);
        scenario
            .parameters
            .insert(RAW_CONTENT_KEY.to_owned(), ParamValue::Text(raw));
        scenario.file_path = Some(path.display().to_string());
        self.log(
            LogLevel::Info,
            "scenario.loaded",
            json!({ "scenario_id": scenario.scenario_id, "path": path.display().to_string(), "format": "afsim" }),
        );
        self.register(scenario.clone());
        Ok(scenario)
    }

    /// Registers a scenario from its JSON form, keeping the stored id.
    pub fn load_structured(&self, path: impl AsRef<Path>) -> Result<Scenario> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AfsimError::NotFound(format!(
                "Scenario JSON file not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path)?;
        let mut scenario: Scenario = serde_json::from_str(&raw)?;
        if scenario.scenario_id.trim().is_empty() {
            scenario.scenario_id = Uuid::new_v4().to_string();
        }
        scenario.file_path = Some(path.display().to_string());
        self.log(
            LogLevel::Info,
            "scenario.loaded",
            json!({ "scenario_id": scenario.scenario_id, "path": path.display().to_string(), "format": "json" }),
        );
        self.register(scenario.clone());
        Ok(scenario)
    }

    /// Writes the text form, by default to `<scenarios_dir>/<name>.afsim`.
    pub fn save_text(&self, scenario_id: &str, path: Option<&Path>) -> Result<PathBuf> {
        self.save_with(scenario_id, path, "afsim", |scenario| Ok(scenario.to_afsim()))
    }

    /// Writes pretty JSON, by default to `<scenarios_dir>/<name>.json`.
    pub fn save_structured(&self, scenario_id: &str, path: Option<&Path>) -> Result<PathBuf> {
        self.save_with(scenario_id, path, "json", |scenario| {
            Ok(serde_json::to_string_pretty(scenario)?)
        })
    }

    fn save_with(
        &self,
        scenario_id: &str,
        path: Option<&Path>,
        extension: &str,
        render: impl FnOnce(&Scenario) -> Result<String>,
    ) -> Result<PathBuf> {
        let target = self.with_scenario_mut(scenario_id, |scenario| {
            let target = path.map_or_else(
                || self.scenarios_dir.join(format!("{}.{extension}", scenario.name)),
                Path::to_path_buf,
            );
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, render(&*scenario)?)?;
            scenario.file_path = Some(target.display().to_string());
            Ok::<_, AfsimError>(target)
        })??;
        self.log(
            LogLevel::Info,
            "scenario.saved",
            json!({ "scenario_id": scenario_id, "path": target.display().to_string(), "format": extension }),
        );
        Ok(target)
    }

    /// Checks the scenario for structural problems.
    pub fn validate(&self, scenario_id: &str) -> Result<ValidationReport> {
        let report = self.with_scenario(scenario_id, |scenario| {
            let mut errors = Vec::new();
            let mut warnings = Vec::new();
            if scenario.name.trim().is_empty() {
                errors.push("Scenario name is empty.".to_owned());
            }
            if scenario.duration_s <= 0.0 {
                errors.push(format!(
                    "Simulation duration must be positive (got {}).",
                    format_float(scenario.duration_s)
                ));
            }
            if scenario.time_step_s <= 0.0 {
                errors.push(format!(
                    "Time step must be positive (got {}).",
                    format_float(scenario.time_step_s)
                ));
            }
            if scenario.time_step_s > scenario.duration_s {
                warnings.push("Time step is larger than duration.".to_owned());
            }
            if scenario.platforms.is_empty() {
                warnings.push("Scenario has no platforms.".to_owned());
            }
            let mut seen = HashSet::new();
            let mut duplicates: Vec<&str> = Vec::new();
            for platform in &scenario.platforms {
                let name = platform.name.as_str();
                if !seen.insert(name) && !duplicates.contains(&name) {
                    duplicates.push(name);
                }
            }
            if !duplicates.is_empty() {
                errors.push(format!(
                    "Duplicate platform names found: {}.",
                    duplicates.join(", ")
                ));
            }
            ValidationReport {
                valid: errors.is_empty(),
                errors,
                warnings,
            }
        })?;
        self.log(
            LogLevel::Info,
            "scenario.validated",
            json!({
                "scenario_id": scenario_id,
                "valid": report.valid,
                "errors": report.errors.len(),
                "warnings": report.warnings.len(),
            }),
        );
        Ok(report)
    }

    /// Summaries in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<ScenarioSummary> {
        self.scenarios
            .read()
            .values()
            .map(ScenarioSummary::from)
            .collect()
    }

    /// Returns a copy of the scenario.
    pub fn get(&self, scenario_id: &str) -> Result<Scenario> {
        self.with_scenario(scenario_id, Clone::clone)
    }

    /// Forgets the scenario; files on disk are left alone.
    pub fn delete(&self, scenario_id: &str) -> bool {
        let removed = self.scenarios.write().shift_remove(scenario_id).is_some();
        if removed {
            self.log(
                LogLevel::Info,
                "scenario.deleted",
                json!({ "scenario_id": scenario_id }),
            );
        }
        removed
    }

    /// `*.afsim` and `*.json` files in the scenarios directory, sorted.
    pub fn list_persisted_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.scenarios_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("afsim" | "json")
                )
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Runs `f` against the scenario under the read lock.
    pub fn with_scenario<T>(&self, scenario_id: &str, f: impl FnOnce(&Scenario) -> T) -> Result<T> {
        let guard = self.scenarios.read();
        guard
            .get(scenario_id)
            .map(f)
            .ok_or_else(|| not_found(scenario_id))
    }

    /// Runs `f` against the scenario under the write lock.
    pub fn with_scenario_mut<T>(
        &self,
        scenario_id: &str,
        f: impl FnOnce(&mut Scenario) -> T,
    ) -> Result<T> {
        let mut guard = self.scenarios.write();
        guard
            .get_mut(scenario_id)
            .map(f)
            .ok_or_else(|| not_found(scenario_id))
    }

    fn register(&self, scenario: Scenario) {
        self.scenarios
            .write()
            .insert(scenario.scenario_id.clone(), scenario);
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn not_found(scenario_id: &str) -> AfsimError {
    AfsimError::NotFound(format!("Scenario '{scenario_id}' not found."))
}
