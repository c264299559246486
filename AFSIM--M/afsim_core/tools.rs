use std::{path::Path, sync::Arc};

use serde::Serialize;
use serde_json::{json, Map, Value};
use shared_logging::LogLevel;

use crate::{
    entity_manager::{ComponentSlot, NewPlatform, PlatformUpdate},
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
    params::{params_from_json, Params},
    results::{ResultFormat, DEFAULT_MAX_LINES, DEFAULT_MAX_ROWS},
    runtime::AppState,
};

/// Published description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    /// Tool name used by `tools/call`.
    pub name: &'static str,
    /// One-line summary.
    pub description: &'static str,
    /// JSON schema of the argument object.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// `(name, json type, description)`
type Prop = (&'static str, &'static str, &'static str);

struct ToolDef {
    name: &'static str,
    description: &'static str,
    props: &'static [Prop],
    required: &'static [&'static str],
}

const SCENARIO_ID: Prop = ("scenario_id", "string", "Scenario id.");
const PLATFORM_NAME: Prop = ("platform_name", "string", "Platform name.");
const RUN_ID: Prop = ("run_id", "string", "Simulation run id.");
const PARAMETERS: Prop = ("parameters", "object", "Free-form parameters.");
const EXTRA_ARGS: Prop = ("extra_args", "array", "Additional command-line arguments.");
const DETACH: Prop = ("detach", "boolean", "Launch without waiting (default true).");
const FILE_PATH: Prop = ("file_path", "string", "Path to the file.");

const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "create_scenario",
        description: "Create a new scenario in memory.",
        props: &[
            ("name", "string", "Scenario name."),
            ("description", "string", "Human-readable description."),
            ("duration_s", "number", "Simulated duration in seconds (default 3600)."),
            ("time_step_s", "number", "Time step in seconds (default 1)."),
        ],
        required: &["name"],
    },
    ToolDef {
        name: "load_scenario",
        description: "Load a scenario file (.afsim text or structured JSON).",
        props: &[FILE_PATH, ("format", "string", "'afsim' (default) or 'json'.")],
        required: &["file_path"],
    },
    ToolDef {
        name: "save_scenario",
        description: "Save a scenario as AFSIM text or JSON.",
        props: &[
            SCENARIO_ID,
            ("file_path", "string", "Destination; defaults to the scenarios directory."),
            ("format", "string", "'afsim' (default) or 'json'."),
        ],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "validate_scenario",
        description: "Validate a scenario and report errors and warnings.",
        props: &[SCENARIO_ID],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "list_scenarios",
        description: "List scenarios held in memory.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "get_scenario_text",
        description: "Render a scenario as AFSIM input text.",
        props: &[SCENARIO_ID],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "delete_scenario",
        description: "Forget a scenario (files on disk are kept).",
        props: &[SCENARIO_ID],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "list_scenario_files",
        description: "List .afsim and .json files in the scenarios directory.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "create_platform",
        description: "Add a platform to a scenario.",
        props: &[
            SCENARIO_ID,
            ("name", "string", "Platform name, unique within the scenario."),
            ("platform_type", "string", "Platform type (default wsf_platform)."),
            ("latitude", "number", "Latitude in degrees."),
            ("longitude", "number", "Longitude in degrees."),
            ("altitude_m", "number", "Altitude in meters."),
            PARAMETERS,
        ],
        required: &["scenario_id", "name"],
    },
    ToolDef {
        name: "delete_platform",
        description: "Remove a platform from a scenario.",
        props: &[SCENARIO_ID, PLATFORM_NAME],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "modify_platform",
        description: "Update position, type or parameters of a platform.",
        props: &[
            SCENARIO_ID,
            PLATFORM_NAME,
            ("latitude", "number", "New latitude."),
            ("longitude", "number", "New longitude."),
            ("altitude_m", "number", "New altitude."),
            ("platform_type", "string", "New platform type."),
            ("parameters", "object", "Parameters merged into the platform."),
        ],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "get_platform",
        description: "Describe one platform.",
        props: &[SCENARIO_ID, PLATFORM_NAME],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "list_platforms",
        description: "List platforms of a scenario.",
        props: &[SCENARIO_ID],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "add_mover",
        description: "Attach a mover to a platform.",
        props: &[
            SCENARIO_ID,
            PLATFORM_NAME,
            ("mover_type", "string", "Mover type (default wsf_route_mover)."),
            ("mover_name", "string", "Component name."),
            PARAMETERS,
        ],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "add_sensor",
        description: "Attach a sensor to a platform.",
        props: &[
            SCENARIO_ID,
            PLATFORM_NAME,
            ("sensor_type", "string", "Sensor type (default wsf_radar_sensor)."),
            ("sensor_name", "string", "Component name."),
            PARAMETERS,
        ],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "add_weapon",
        description: "Attach a weapon to a platform.",
        props: &[
            SCENARIO_ID,
            PLATFORM_NAME,
            ("weapon_type", "string", "Weapon type (default wsf_missile)."),
            ("weapon_name", "string", "Component name."),
            PARAMETERS,
        ],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "remove_component",
        description: "Remove a named component from a platform.",
        props: &[
            SCENARIO_ID,
            PLATFORM_NAME,
            ("component_name", "string", "Component name."),
        ],
        required: &["scenario_id", "platform_name", "component_name"],
    },
    ToolDef {
        name: "list_components",
        description: "List components of a platform.",
        props: &[SCENARIO_ID, PLATFORM_NAME],
        required: &["scenario_id", "platform_name"],
    },
    ToolDef {
        name: "run_simulation",
        description: "Save a scenario and launch the configured AFSIM executable on it.",
        props: &[
            SCENARIO_ID,
            ("dry_run", "boolean", "Record a completed run without executing anything."),
            EXTRA_ARGS,
        ],
        required: &["scenario_id"],
    },
    ToolDef {
        name: "stop_simulation",
        description: "Terminate a running simulation.",
        props: &[RUN_ID],
        required: &["run_id"],
    },
    ToolDef {
        name: "get_simulation_status",
        description: "Poll a simulation run.",
        props: &[RUN_ID],
        required: &["run_id"],
    },
    ToolDef {
        name: "list_simulation_runs",
        description: "List simulation runs in creation order.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "set_afsim_binary",
        description: "Configure the executable used by run_simulation (empty clears it).",
        props: &[("binary_path", "string", "Path to the executable.")],
        required: &["binary_path"],
    },
    ToolDef {
        name: "get_afsim_binary",
        description: "Show the executable used by run_simulation.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "list_result_files",
        description: "Recursively list .aer, .evt, .csv and .json result files.",
        props: &[
            RUN_ID,
            ("directory", "string", "Directory to scan instead of the run output root."),
            ("formats", "string", "Comma-separated formats, e.g. 'csv,evt'."),
        ],
        required: &[],
    },
    ToolDef {
        name: "query_csv_results",
        description: "Read rows from a CSV result file.",
        props: &[
            FILE_PATH,
            ("columns", "string", "Comma-separated columns to keep."),
            ("max_rows", "integer", "Row limit (default 1000)."),
        ],
        required: &["file_path"],
    },
    ToolDef {
        name: "query_event_results",
        description: "Read lines from an .evt or .aer result file.",
        props: &[FILE_PATH, ("max_lines", "integer", "Line limit (default 500).")],
        required: &["file_path"],
    },
    ToolDef {
        name: "export_results_to_json",
        description: "Convert a result file to a JSON array.",
        props: &[
            FILE_PATH,
            ("output_path", "string", "Destination; defaults to the source with a .json extension."),
        ],
        required: &["file_path"],
    },
    ToolDef {
        name: "get_result_summary",
        description: "Count result files and bytes per format.",
        props: &[("directory", "string", "Directory to summarise.")],
        required: &[],
    },
    ToolDef {
        name: "detect_afsim_installation",
        description: "Report the AFSIM home and which tool binaries resolve.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "set_afsim_home",
        description: "Set the AFSIM installation root and re-detect binaries.",
        props: &[("path", "string", "Installation root containing bin/.")],
        required: &["path"],
    },
    ToolDef {
        name: "set_binary_path",
        description: "Pin a tool (wizard, mission, warlock, mystic) to an explicit binary.",
        props: &[
            ("tool", "string", "Tool key."),
            ("path", "string", "Binary path."),
        ],
        required: &["tool", "path"],
    },
    ToolDef {
        name: "list_binary_paths",
        description: "Show the resolved binary for every tool.",
        props: &[],
        required: &[],
    },
    ToolDef {
        name: "run_wizard",
        description: "Launch the AFSIM Wizard IDE.",
        props: &[
            ("scenario_file", "string", "File to open."),
            EXTRA_ARGS,
            DETACH,
        ],
        required: &[],
    },
    ToolDef {
        name: "run_mission",
        description: "Run the AFSIM mission executable.",
        props: &[
            ("scenario_file", "string", "Scenario file."),
            EXTRA_ARGS,
            DETACH,
        ],
        required: &[],
    },
    ToolDef {
        name: "run_warlock",
        description: "Run Warlock and wait for it to finish.",
        props: &[
            ("scenario_file", "string", "Scenario file."),
            ("output_dir", "string", "Output directory (default '.')."),
            EXTRA_ARGS,
        ],
        required: &["scenario_file"],
    },
    ToolDef {
        name: "run_mystic",
        description: "Launch the Mystic result viewer.",
        props: &[
            ("results_dir", "string", "Directory holding results."),
            EXTRA_ARGS,
            DETACH,
        ],
        required: &["results_dir"],
    },
    ToolDef {
        name: "generate_scenario_from_text",
        description: "Build a scenario from a natural-language description.",
        props: &[("prompt", "string", "Description, e.g. 'two fighters with radar for 2 hours'.")],
        required: &["prompt"],
    },
    ToolDef {
        name: "refine_scenario",
        description: "Apply a natural-language change such as 'add 2 more tanks'.",
        props: &[
            SCENARIO_ID,
            ("refinement_prompt", "string", "Requested change."),
        ],
        required: &["scenario_id", "refinement_prompt"],
    },
];

/// Published tool catalogue.
#[must_use]
pub fn specs() -> Vec<ToolSpec> {
    TOOLS.iter().map(ToolDef::spec).collect()
}

/// Whether a tool result carries the `error` sentinel.
#[must_use]
pub fn is_error(result: &Value) -> bool {
    result.get("error").is_some_and(|err| !err.is_null())
}

impl ToolDef {
    fn spec(&self) -> ToolSpec {
        let mut properties = Map::new();
        for (name, kind, description) in self.props {
            let mut schema = json!({ "type": kind, "description": description });
            if *kind == "array" {
                schema["items"] = json!({ "type": "string" });
            }
            properties.insert((*name).to_owned(), schema);
        }
        ToolSpec {
            name: self.name,
            description: self.description,
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": self.required,
            }),
        }
    }
}

/// Flat JSON argument object of a call.
struct Args<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map
            .and_then(|map| map.get(key))
            .filter(|value| !value.is_null())
    }

    /// Non-blank string.
    fn text(&self, key: &str) -> Option<&'a str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    fn required(&self, key: &str) -> Result<&'a str> {
        self.text(key)
            .ok_or_else(|| AfsimError::InvalidArgument(format!("'{key}' is required.")))
    }

    fn number(&self, key: &str) -> Result<Option<f64>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| AfsimError::InvalidArgument(format!("'{key}' must be a number.")))
    }

    fn count(&self, key: &str, default: usize) -> Result<usize> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
            .ok_or_else(|| {
                AfsimError::InvalidArgument(format!("'{key}' must be a non-negative integer."))
            })
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => matches!(raw.trim(), "true" | "1" | "yes"),
            _ => default,
        }
    }

    /// Array of strings, or one string split on `separator`.
    fn list(&self, key: &str, separator: char) -> Result<Vec<String>> {
        let items: Vec<String> = match self.get(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(raw)) => raw.split(separator).map(str::to_owned).collect(),
            Some(_) => {
                return Err(AfsimError::InvalidArgument(format!(
                    "'{key}' must be a list of strings."
                )))
            }
        };
        Ok(items
            .into_iter()
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect())
    }

    fn params(&self, key: &str) -> Result<Option<Params>> {
        self.get(key).map_or(Ok(None), |value| {
            params_from_json(value)
                .map(Some)
                .ok_or_else(|| AfsimError::InvalidArgument(format!("'{key}' must be an object.")))
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Maps tool names and flat JSON arguments onto the services.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    state: Arc<AppState>,
    telemetry: Option<ServiceTelemetry>,
}

impl ToolRouter {
    /// Creates a router over shared state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        let telemetry = state.telemetry().map(|tel| tel.scoped("tools"));
        Self { state, telemetry }
    }

    /// Shared state.
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Published tool catalogue.
    #[must_use]
    pub fn specs(&self) -> Vec<ToolSpec> {
        specs()
    }

    /// Runs a tool. Failures come back as `{"error": "<message>"}`.
    pub async fn call(&self, name: &str, arguments: &Value) -> Value {
        let args = Args::new(arguments);
        self.log(LogLevel::Debug, "tool.called", json!({ "tool": name }));
        match self.dispatch(name, &args).await {
            Ok(result) => result,
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "tool.failed",
                    json!({ "tool": name, "kind": err.kind(), "error": err.to_string() }),
                );
                json!({ "error": err.to_string() })
            }
        }
    }

    async fn dispatch(&self, name: &str, args: &Args<'_>) -> Result<Value> {
        if let Some(result) = self.scenario_tool(name, args)? {
            return Ok(result);
        }
        if let Some(result) = self.entity_tool(name, args)? {
            return Ok(result);
        }
        if let Some(result) = self.simulation_tool(name, args)? {
            return Ok(result);
        }
        if let Some(result) = self.result_tool(name, args)? {
            return Ok(result);
        }
        if let Some(result) = self.backend_tool(name, args).await? {
            return Ok(result);
        }
        if let Some(result) = self.generator_tool(name, args)? {
            return Ok(result);
        }
        Err(AfsimError::NotFound(format!("Unknown tool: {name}")))
    }

    fn scenario_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let scenarios = self.state.scenarios();
        let structured = || match args.text("format").unwrap_or("afsim") {
            "afsim" => Ok(false),
            "json" => Ok(true),
            other => Err(AfsimError::InvalidArgument(format!(
                "Unknown scenario format '{other}'; expected 'afsim' or 'json'."
            ))),
        };
        let result = match name {
            "create_scenario" => {
                let scenario = scenarios.create(
                    args.required("name")?,
                    args.text("description").unwrap_or_default(),
                    args.number("duration_s")?,
                    args.number("time_step_s")?,
                )?;
                json!({
                    "scenario_id": scenario.scenario_id,
                    "name": scenario.name,
                    "description": scenario.description,
                    "duration_s": scenario.duration_s,
                    "time_step_s": scenario.time_step_s,
                })
            }
            "load_scenario" => {
                let path = args.required("file_path")?;
                let scenario = if structured()? {
                    scenarios.load_structured(path)?
                } else {
                    scenarios.load_text(path)?
                };
                json!({
                    "scenario_id": scenario.scenario_id,
                    "name": scenario.name,
                    "file_path": scenario.file_path,
                    "platform_count": scenario.platforms.len(),
                })
            }
            "save_scenario" => {
                let id = args.required("scenario_id")?;
                let target = args.text("file_path").map(Path::new);
                let saved = if structured()? {
                    scenarios.save_structured(id, target)?
                } else {
                    scenarios.save_text(id, target)?
                };
                json!({ "saved_path": saved.display().to_string() })
            }
            "validate_scenario" => to_json(&scenarios.validate(args.required("scenario_id")?)?)?,
            "list_scenarios" => to_json(&scenarios.list())?,
            "get_scenario_text" => {
                let (name, content) = scenarios
                    .with_scenario(args.required("scenario_id")?, |s| (s.name.clone(), s.to_afsim()))?;
                json!({ "name": name, "content": content })
            }
            "delete_scenario" => json!({ "removed": scenarios.delete(args.required("scenario_id")?) }),
            "list_scenario_files" => {
                let files: Vec<String> = scenarios
                    .list_persisted_files()?
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                json!(files)
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn entity_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let entities = self.state.entities();
        let slot = match name {
            "add_mover" => Some((ComponentSlot::Mover, "mover_type", "mover_name")),
            "add_sensor" => Some((ComponentSlot::Sensor, "sensor_type", "sensor_name")),
            "add_weapon" => Some((ComponentSlot::Weapon, "weapon_type", "weapon_name")),
            _ => None,
        };
        if let Some((slot, type_key, name_key)) = slot {
            let info = entities.add_component(
                args.required("scenario_id")?,
                args.required("platform_name")?,
                slot,
                args.text(type_key),
                args.text(name_key),
                args.params("parameters")?,
            )?;
            return to_json(&info).map(Some);
        }
        let result = match name {
            "create_platform" => {
                let mut request = NewPlatform::named(args.required("name")?).at(
                    args.number("latitude")?.unwrap_or_default(),
                    args.number("longitude")?.unwrap_or_default(),
                    args.number("altitude_m")?.unwrap_or_default(),
                );
                if let Some(platform_type) = args.text("platform_type") {
                    request = request.platform_type(platform_type);
                }
                if let Some(parameters) = args.params("parameters")? {
                    request = request.parameters(parameters);
                }
                to_json(&entities.create_platform(args.required("scenario_id")?, request)?)?
            }
            "delete_platform" => json!({
                "removed": entities.delete_platform(
                    args.required("scenario_id")?,
                    args.required("platform_name")?,
                )?
            }),
            "modify_platform" => {
                let update = PlatformUpdate {
                    latitude: args.number("latitude")?,
                    longitude: args.number("longitude")?,
                    altitude_m: args.number("altitude_m")?,
                    platform_type: args.text("platform_type").map(str::to_owned),
                    parameters: args.params("parameters")?,
                };
                to_json(&entities.modify_platform(
                    args.required("scenario_id")?,
                    args.required("platform_name")?,
                    update,
                )?)?
            }
            "get_platform" => to_json(&entities.get_platform(
                args.required("scenario_id")?,
                args.required("platform_name")?,
            )?)?,
            "list_platforms" => to_json(&entities.list_platforms(args.required("scenario_id")?)?)?,
            "remove_component" => json!({
                "removed": entities.remove_component(
                    args.required("scenario_id")?,
                    args.required("platform_name")?,
                    args.required("component_name")?,
                )?
            }),
            "list_components" => to_json(&entities.list_components(
                args.required("scenario_id")?,
                args.required("platform_name")?,
            )?)?,
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn simulation_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let simulations = self.state.simulations();
        let result = match name {
            "run_simulation" => {
                let run = simulations.run(
                    args.required("scenario_id")?,
                    &args.list("extra_args", ' ')?,
                    args.flag("dry_run", false),
                )?;
                to_json(&simulations.status(&run.run_id)?)?
            }
            "stop_simulation" => to_json(&simulations.stop(args.required("run_id")?)?)?,
            "get_simulation_status" => to_json(&simulations.status(args.required("run_id")?)?)?,
            "list_simulation_runs" => to_json(&simulations.list())?,
            "set_afsim_binary" => {
                let path = args
                    .get("binary_path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AfsimError::InvalidArgument("'binary_path' is required.".into()))?;
                simulations.set_executable(path);
                json!({
                    "binary_path": path.trim(),
                    "configured": simulations.get_executable().is_some(),
                })
            }
            "get_afsim_binary" => json!({
                "binary_path": simulations.get_executable().map(|p| p.display().to_string()),
            }),
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn result_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let results = self.state.results();
        let result = match name {
            "list_result_files" => {
                let formats = args
                    .list("formats", ',')?
                    .iter()
                    .map(|raw| {
                        ResultFormat::parse(raw).ok_or_else(|| {
                            AfsimError::InvalidArgument(format!("Unknown result format: {raw}"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let formats = (!formats.is_empty()).then_some(formats.as_slice());
                to_json(&results.list_result_files(
                    args.text("run_id"),
                    args.text("directory").map(Path::new),
                    formats,
                ))?
            }
            "query_csv_results" => {
                let columns = args.list("columns", ',')?;
                let columns = (!columns.is_empty()).then_some(columns.as_slice());
                to_json(&results.query_csv(
                    Path::new(args.required("file_path")?),
                    columns,
                    args.count("max_rows", DEFAULT_MAX_ROWS)?,
                )?)?
            }
            "query_event_results" => to_json(&results.query_lines(
                Path::new(args.required("file_path")?),
                args.count("max_lines", DEFAULT_MAX_LINES)?,
            )?)?,
            "export_results_to_json" => {
                let output = results.export_to_json(
                    Path::new(args.required("file_path")?),
                    args.text("output_path").map(Path::new),
                )?;
                json!({ "output_path": output.display().to_string() })
            }
            "get_result_summary" => {
                to_json(&results.summary(args.text("directory").map(Path::new)))?
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    async fn backend_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let backend = self.state.backend();
        let result = match name {
            "detect_afsim_installation" => to_json(&backend.detect_installation())?,
            "set_afsim_home" => {
                backend.set_afsim_home(args.required("path")?);
                to_json(&backend.detect_installation())?
            }
            "set_binary_path" => {
                let tool = args.required("tool")?;
                let path = args.required("path")?;
                backend.set_binary_path(tool, path);
                json!({ "tool": tool, "path": path, "configured": true })
            }
            "list_binary_paths" => to_json(&backend.list_binary_paths())?,
            "run_wizard" => to_json(
                &backend
                    .run_wizard(
                        args.text("scenario_file"),
                        &args.list("extra_args", ' ')?,
                        args.flag("detach", true),
                    )
                    .await,
            )?,
            "run_mission" => to_json(
                &backend
                    .run_mission(
                        args.text("scenario_file"),
                        &args.list("extra_args", ' ')?,
                        args.flag("detach", true),
                    )
                    .await,
            )?,
            "run_warlock" => to_json(
                &backend
                    .run_warlock(
                        args.required("scenario_file")?,
                        args.text("output_dir").unwrap_or("."),
                        &args.list("extra_args", ' ')?,
                    )
                    .await,
            )?,
            "run_mystic" => to_json(
                &backend
                    .run_mystic(
                        args.required("results_dir")?,
                        &args.list("extra_args", ' ')?,
                        args.flag("detach", true),
                    )
                    .await,
            )?,
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn generator_tool(&self, name: &str, args: &Args<'_>) -> Result<Option<Value>> {
        let generator = self.state.generator();
        let result = match name {
            "generate_scenario_from_text" => to_json(&generator.generate(args.required("prompt")?)?)?,
            "refine_scenario" => {
                let prompt = args
                    .text("refinement_prompt")
                    .or_else(|| args.text("prompt"))
                    .ok_or_else(|| {
                        AfsimError::InvalidArgument("'refinement_prompt' is required.".into())
                    })?;
                to_json(&generator.refine(args.required("scenario_id")?, prompt)?)?
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}
