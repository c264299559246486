use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::{format_float, Params};

/// Default platform type tag.
pub const DEFAULT_PLATFORM_TYPE: &str = "wsf_platform";
/// Default simulated duration in seconds.
pub const DEFAULT_DURATION_S: f64 = 3600.0;
/// Default simulation time step in seconds.
pub const DEFAULT_TIME_STEP_S: f64 = 1.0;

/// Geographic position of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    #[serde(default, alias = "lat")]
    pub latitude: f64,
    /// Longitude in degrees.
    #[serde(default, alias = "lon")]
    pub longitude: f64,
    /// Altitude in meters.
    #[serde(default, alias = "alt")]
    pub altitude_m: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64, altitude_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude_m,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}deg {}deg {}m",
            format_float(self.latitude),
            format_float(self.longitude),
            format_float(self.altitude_m)
        )
    }
}

/// Broad role of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    /// Moves the platform.
    Mover,
    /// Detects other platforms.
    Sensor,
    /// Engages other platforms.
    Weapon,
    /// Unrecognised tag.
    Other,
}

/// Component type tag. Known AFSIM types plus an open escape hatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ComponentKind {
    /// `wsf_fixed_mover`
    FixedMover,
    /// `wsf_route_mover`
    RouteMover,
    /// `wsf_air_mover`
    AirMover,
    /// `wsf_ground_mover`
    GroundMover,
    /// `wsf_surface_mover`
    SurfaceMover,
    /// `wsf_subsurface_mover`
    SubsurfaceMover,
    /// `wsf_orbit_mover`
    OrbitMover,
    /// `wsf_radar_sensor`
    RadarSensor,
    /// `wsf_eo_sensor`
    EoSensor,
    /// `wsf_ir_sensor`
    IrSensor,
    /// `wsf_comm_sensor`
    CommSensor,
    /// `wsf_sensor`
    GenericSensor,
    /// `wsf_missile`
    Missile,
    /// `wsf_bomb`
    Bomb,
    /// `wsf_bullet`
    Bullet,
    /// `wsf_weapon`
    GenericWeapon,
    /// Any other tag, kept verbatim.
    Custom(String),
}

impl ComponentKind {
    const KNOWN: [(Self, &'static str, &'static str); 16] = [
        (Self::FixedMover, "wsf_fixed_mover", "end_fixed_mover"),
        (Self::RouteMover, "wsf_route_mover", "end_route_mover"),
        (Self::AirMover, "wsf_air_mover", "end_air_mover"),
        (Self::GroundMover, "wsf_ground_mover", "end_ground_mover"),
        (Self::SurfaceMover, "wsf_surface_mover", "end_surface_mover"),
        (Self::SubsurfaceMover, "wsf_subsurface_mover", "end_subsurface_mover"),
        (Self::OrbitMover, "wsf_orbit_mover", "end_orbit_mover"),
        (Self::RadarSensor, "wsf_radar_sensor", "end_radar_sensor"),
        (Self::EoSensor, "wsf_eo_sensor", "end_eo_sensor"),
        (Self::IrSensor, "wsf_ir_sensor", "end_ir_sensor"),
        (Self::CommSensor, "wsf_comm_sensor", "end_comm_sensor"),
        (Self::GenericSensor, "wsf_sensor", "end_sensor"),
        (Self::Missile, "wsf_missile", "end_missile"),
        (Self::Bomb, "wsf_bomb", "end_bomb"),
        (Self::Bullet, "wsf_bullet", "end_bullet"),
        (Self::GenericWeapon, "wsf_weapon", "end_weapon"),
    ];

    /// Parses a tag, falling back to [`ComponentKind::Custom`].
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let trimmed = tag.trim();
        Self::KNOWN
            .iter()
            .find(|(_, known, _)| known.eq_ignore_ascii_case(trimmed))
            .map_or_else(|| Self::Custom(trimmed.to_owned()), |(kind, _, _)| kind.clone())
    }

    /// The tag written in scenario text.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Custom(tag) => tag,
            known => Self::KNOWN
                .iter()
                .find(|(kind, _, _)| kind == known)
                .map_or("", |(_, tag, _)| tag),
        }
    }

    /// Token closing the component block.
    ///
    /// Custom tags drop everything up to the first `_`; a tag without one is
    /// used whole.
    #[must_use]
    pub fn closing_token(&self) -> String {
        match self {
            Self::Custom(tag) => {
                let suffix = tag.split_once('_').map_or(tag.as_str(), |(_, rest)| rest);
                format!("end_{suffix}")
            }
            known => Self::KNOWN
                .iter()
                .find(|(kind, _, _)| kind == known)
                .map_or_else(String::new, |(_, _, token)| (*token).to_owned()),
        }
    }

    /// Broad role derived from the tag.
    #[must_use]
    pub fn category(&self) -> ComponentCategory {
        match self {
            Self::FixedMover
            | Self::RouteMover
            | Self::AirMover
            | Self::GroundMover
            | Self::SurfaceMover
            | Self::SubsurfaceMover
            | Self::OrbitMover => ComponentCategory::Mover,
            Self::RadarSensor
            | Self::EoSensor
            | Self::IrSensor
            | Self::CommSensor
            | Self::GenericSensor => ComponentCategory::Sensor,
            Self::Missile | Self::Bomb | Self::Bullet | Self::GenericWeapon => {
                ComponentCategory::Weapon
            }
            Self::Custom(tag) if tag.ends_with("_mover") => ComponentCategory::Mover,
            Self::Custom(tag) if tag.ends_with("_sensor") => ComponentCategory::Sensor,
            Self::Custom(_) => ComponentCategory::Other,
        }
    }
}

impl From<String> for ComponentKind {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<&str> for ComponentKind {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<ComponentKind> for String {
    fn from(kind: ComponentKind) -> Self {
        kind.tag().to_owned()
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Mover, sensor or weapon attached to a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Name, unique by convention only.
    pub name: String,
    /// Type tag.
    #[serde(rename = "component_type", alias = "kind")]
    pub kind: ComponentKind,
    /// Free-form parameters.
    #[serde(default)]
    pub parameters: Params,
}

impl Component {
    /// Creates a component without parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<ComponentKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            parameters: Params::new(),
        }
    }

    /// Renders the indented component block.
    #[must_use]
    pub fn to_afsim_block(&self) -> String {
        let mut lines = vec![format!("  {} {}", self.kind, self.name)];
        lines.extend(
            self.parameters
                .iter()
                .map(|(key, value)| format!("    {key} {value}")),
        );
        lines.push(format!("  {}", self.kind.closing_token()));
        lines.join("\n")
    }
}

/// Simulated actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    /// Name, unique within the scenario.
    pub name: String,
    /// Platform type tag.
    #[serde(default = "default_platform_type")]
    pub platform_type: String,
    /// Initial position.
    #[serde(default)]
    pub position: Position,
    /// Attached components in insertion order.
    #[serde(default)]
    pub components: Vec<Component>,
    /// Free-form parameters.
    #[serde(default)]
    pub parameters: Params,
}

impl Platform {
    /// Creates a platform of the default type at the origin.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform_type: default_platform_type(),
            position: Position::default(),
            components: Vec::new(),
            parameters: Params::new(),
        }
    }

    /// Renders the `platform ... end_platform` block.
    #[must_use]
    pub fn to_afsim_block(&self) -> String {
        let mut lines = vec![
            format!("platform {}", self.name),
            format!("  platform_type {}", self.platform_type),
            format!("  position {}", self.position),
        ];
        lines.extend(
            self.parameters
                .iter()
                .map(|(key, value)| format!("  {key} {value}")),
        );
        lines.extend(self.components.iter().map(Component::to_afsim_block));
        lines.push("end_platform".to_owned());
        lines.join("\n")
    }
}

fn default_platform_type() -> String {
    DEFAULT_PLATFORM_TYPE.to_owned()
}

const fn default_duration() -> f64 {
    DEFAULT_DURATION_S
}

const fn default_time_step() -> f64 {
    DEFAULT_TIME_STEP_S
}

/// Top-level declarative scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Registry identifier.
    #[serde(default, alias = "id")]
    pub scenario_id: String,
    /// Scenario name, also the default file stem.
    pub name: String,
    /// Free text description.
    #[serde(default)]
    pub description: String,
    /// Simulated duration in seconds.
    #[serde(default = "default_duration", alias = "duration")]
    pub duration_s: f64,
    /// Simulation step in seconds.
    #[serde(default = "default_time_step", alias = "time_step")]
    pub time_step_s: f64,
    /// Scenario-level parameters.
    #[serde(default)]
    pub parameters: Params,
    /// Platforms in insertion order.
    #[serde(default)]
    pub platforms: Vec<Platform>,
    /// Last file this scenario was loaded from or saved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Scenario {
    /// Creates an empty scenario with a fresh identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            scenario_id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            duration_s: DEFAULT_DURATION_S,
            time_step_s: DEFAULT_TIME_STEP_S,
            parameters: Params::new(),
            platforms: Vec::new(),
            file_path: None,
        }
    }

    /// Looks up a platform by exact name.
    #[must_use]
    pub fn platform(&self, name: &str) -> Option<&Platform> {
        self.platforms.iter().find(|platform| platform.name == name)
    }

    /// Mutable platform lookup by exact name.
    pub fn platform_mut(&mut self, name: &str) -> Option<&mut Platform> {
        self.platforms
            .iter_mut()
            .find(|platform| platform.name == name)
    }

    /// Renders the scenario in AFSIM text form.
    #[must_use]
    pub fn to_afsim(&self) -> String {
        let mut lines = vec![
            format!("# Scenario: {}", self.name),
            format!("# {}", self.description),
            String::new(),
            format!("simulation_duration {}s", format_float(self.duration_s)),
            format!("time_step {}s", format_float(self.time_step_s)),
            String::new(),
        ];
        lines.extend(
            self.parameters
                .iter()
                .map(|(key, value)| format!("{key} {value}")),
        );
        if !self.parameters.is_empty() {
            lines.push(String::new());
        }
        for platform in &self.platforms {
            lines.push(platform.to_afsim_block());
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

/// Lifecycle state of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    /// Registered, nothing launched yet.
    Idle,
    /// External process alive.
    Running,
    /// Reserved; no operation produces it.
    Paused,
    /// Finished (or dry run).
    Completed,
    /// Could not be launched.
    Failed,
    /// Terminated on request.
    Stopped,
}

impl SimulationStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One execution attempt of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    /// Run identifier.
    pub run_id: String,
    /// Name of the executed scenario.
    pub scenario_name: String,
    /// Scenario text file handed to the executable.
    pub scenario_file: String,
    /// Current state.
    pub status: SimulationStatus,
    /// Launch time.
    pub start_time: Option<DateTime<Utc>>,
    /// Time the run reached a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    /// OS process id while launched.
    pub pid: Option<u32>,
    /// Working directory of the run.
    pub output_dir: String,
    /// Combined stdout/stderr log.
    pub log_file: String,
    /// Failure description, empty otherwise.
    pub error_message: String,
    /// Result files discovered after completion.
    pub result_files: Vec<String>,
}

impl SimulationRun {
    /// Creates an idle run record.
    #[must_use]
    pub fn new(scenario_name: impl Into<String>, scenario_file: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            scenario_name: scenario_name.into(),
            scenario_file: scenario_file.into(),
            status: SimulationStatus::Idle,
            start_time: None,
            end_time: None,
            pid: None,
            output_dir: String::new(),
            log_file: String::new(),
            error_message: String::new(),
            result_files: Vec::new(),
        }
    }
}

/// Serialized view of a run returned to callers.
pub type RunInfo = SimulationRun;
