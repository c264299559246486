use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
    models::{Component, ComponentKind, Platform, Position, Scenario},
    params::Params,
    scenario_manager::ScenarioManager,
};

/// Default mover tag.
pub const DEFAULT_MOVER: &str = "wsf_route_mover";
/// Default sensor tag.
pub const DEFAULT_SENSOR: &str = "wsf_radar_sensor";
/// Default weapon tag.
pub const DEFAULT_WEAPON: &str = "wsf_missile";

/// Platform view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Platform name.
    pub name: String,
    /// Platform type tag.
    pub platform_type: String,
    /// Current position.
    pub position: Position,
    /// Number of attached components.
    pub component_count: usize,
    /// Platform parameters.
    pub parameters: Params,
}

impl From<&Platform> for PlatformInfo {
    fn from(platform: &Platform) -> Self {
        Self {
            name: platform.name.clone(),
            platform_type: platform.platform_type.clone(),
            position: platform.position,
            component_count: platform.components.len(),
            parameters: platform.parameters.clone(),
        }
    }
}

/// Component view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Component name.
    pub name: String,
    /// Type tag.
    pub component_type: String,
    /// Component parameters.
    pub parameters: Params,
}

impl From<&Component> for ComponentInfo {
    fn from(component: &Component) -> Self {
        Self {
            name: component.name.clone(),
            component_type: component.kind.tag().to_owned(),
            parameters: component.parameters.clone(),
        }
    }
}

/// Request for [`EntityManager::create_platform`].
#[derive(Debug, Clone, Default)]
pub struct NewPlatform {
    /// Platform name.
    pub name: String,
    /// Type tag; `wsf_platform` when `None`.
    pub platform_type: Option<String>,
    /// Initial position.
    pub position: Position,
    /// Initial parameters.
    pub parameters: Params,
}

impl NewPlatform {
    /// Request for a default platform at the origin.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the platform type.
    #[must_use]
    pub fn platform_type(mut self, platform_type: impl Into<String>) -> Self {
        self.platform_type = Some(platform_type.into());
        self
    }

    /// Sets the position.
    #[must_use]
    pub fn at(mut self, latitude: f64, longitude: f64, altitude_m: f64) -> Self {
        self.position = Position::new(latitude, longitude, altitude_m);
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Partial update for [`EntityManager::modify_platform`]. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct PlatformUpdate {
    /// New latitude.
    pub latitude: Option<f64>,
    /// New longitude.
    pub longitude: Option<f64>,
    /// New altitude.
    pub altitude_m: Option<f64>,
    /// New type tag.
    pub platform_type: Option<String>,
    /// Parameters merged into the existing bag.
    pub parameters: Option<Params>,
}

/// Component family used to pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSlot {
    /// Movement model.
    Mover,
    /// Detection system.
    Sensor,
    /// Engagement system.
    Weapon,
}

impl ComponentSlot {
    const fn default_kind(self) -> &'static str {
        match self {
            Self::Mover => DEFAULT_MOVER,
            Self::Sensor => DEFAULT_SENSOR,
            Self::Weapon => DEFAULT_WEAPON,
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Mover => "mover",
            Self::Sensor => "sensor",
            Self::Weapon => "weapon",
        }
    }
}

/// Platform and component operations on scenarios owned by a [`ScenarioManager`].
#[derive(Debug, Clone)]
pub struct EntityManager {
    scenarios: Arc<ScenarioManager>,
    telemetry: Option<ServiceTelemetry>,
}

impl EntityManager {
    /// Creates a manager over the shared scenario registry.
    #[must_use]
    pub const fn new(scenarios: Arc<ScenarioManager>) -> Self {
        Self {
            scenarios,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Appends a platform; names must be unique within the scenario.
    pub fn create_platform(&self, scenario_id: &str, request: NewPlatform) -> Result<PlatformInfo> {
        if request.name.trim().is_empty() {
            return Err(AfsimError::InvalidArgument(
                "Platform name must not be empty.".into(),
            ));
        }
        let info = self.scenarios.with_scenario_mut(scenario_id, |scenario| {
            if scenario.platform(&request.name).is_some() {
                return Err(AfsimError::AlreadyExists(format!(
                    "Platform '{}' already exists in scenario '{}'.",
                    request.name, scenario.name
                )));
            }
            let mut platform = Platform::new(request.name);
            if let Some(platform_type) = request.platform_type {
                platform.platform_type = platform_type;
            }
            platform.position = request.position;
            platform.parameters = request.parameters;
            let info = PlatformInfo::from(&platform);
            scenario.platforms.push(platform);
            Ok(info)
        })??;
        self.log(
            "entity.platform.created",
            json!({ "scenario_id": scenario_id, "platform": info.name }),
        );
        Ok(info)
    }

    /// Removes the platform; `false` when no platform had that name.
    pub fn delete_platform(&self, scenario_id: &str, name: &str) -> Result<bool> {
        let removed = self.scenarios.with_scenario_mut(scenario_id, |scenario| {
            let before = scenario.platforms.len();
            scenario.platforms.retain(|platform| platform.name != name);
            scenario.platforms.len() < before
        })?;
        if removed {
            self.log(
                "entity.platform.deleted",
                json!({ "scenario_id": scenario_id, "platform": name }),
            );
        }
        Ok(removed)
    }

    /// Applies a partial update; parameters are merged.
    pub fn modify_platform(
        &self,
        scenario_id: &str,
        name: &str,
        update: PlatformUpdate,
    ) -> Result<PlatformInfo> {
        let info = self.with_platform_mut(scenario_id, name, |platform| {
            if let Some(latitude) = update.latitude {
                platform.position.latitude = latitude;
            }
            if let Some(longitude) = update.longitude {
                platform.position.longitude = longitude;
            }
            if let Some(altitude_m) = update.altitude_m {
                platform.position.altitude_m = altitude_m;
            }
            if let Some(platform_type) = update.platform_type {
                platform.platform_type = platform_type;
            }
            if let Some(parameters) = update.parameters {
                platform.parameters.extend(parameters);
            }
            PlatformInfo::from(&*platform)
        })?;
        self.log(
            "entity.platform.modified",
            json!({ "scenario_id": scenario_id, "platform": name }),
        );
        Ok(info)
    }

    /// Platforms in insertion order.
    pub fn list_platforms(&self, scenario_id: &str) -> Result<Vec<PlatformInfo>> {
        self.scenarios.with_scenario(scenario_id, |scenario| {
            scenario.platforms.iter().map(PlatformInfo::from).collect()
        })
    }

    /// Looks up one platform.
    pub fn get_platform(&self, scenario_id: &str, name: &str) -> Result<PlatformInfo> {
        self.scenarios
            .with_scenario(scenario_id, |scenario| {
                scenario
                    .platform(name)
                    .map(PlatformInfo::from)
                    .ok_or_else(|| platform_not_found(name, scenario))
            })?
    }

    /// Adds a mover, `wsf_route_mover` named `<platform>_mover` by default.
    pub fn add_mover(
        &self,
        scenario_id: &str,
        platform: &str,
        kind: Option<&str>,
        component_name: Option<&str>,
        parameters: Option<Params>,
    ) -> Result<ComponentInfo> {
        self.add_component(scenario_id, platform, ComponentSlot::Mover, kind, component_name, parameters)
    }

    /// Adds a sensor, `wsf_radar_sensor` named `<platform>_sensor` by default.
    pub fn add_sensor(
        &self,
        scenario_id: &str,
        platform: &str,
        kind: Option<&str>,
        component_name: Option<&str>,
        parameters: Option<Params>,
    ) -> Result<ComponentInfo> {
        self.add_component(scenario_id, platform, ComponentSlot::Sensor, kind, component_name, parameters)
    }

    /// Adds a weapon, `wsf_missile` named `<platform>_weapon` by default.
    pub fn add_weapon(
        &self,
        scenario_id: &str,
        platform: &str,
        kind: Option<&str>,
        component_name: Option<&str>,
        parameters: Option<Params>,
    ) -> Result<ComponentInfo> {
        self.add_component(scenario_id, platform, ComponentSlot::Weapon, kind, component_name, parameters)
    }

    /// Appends a component of the given family. Component names are not checked for uniqueness.
    pub fn add_component(
        &self,
        scenario_id: &str,
        platform: &str,
        slot: ComponentSlot,
        kind: Option<&str>,
        component_name: Option<&str>,
        parameters: Option<Params>,
    ) -> Result<ComponentInfo> {
        let kind = kind
            .filter(|tag| !tag.trim().is_empty())
            .map_or_else(|| ComponentKind::parse(slot.default_kind()), ComponentKind::parse);
        let name = component_name
            .filter(|name| !name.trim().is_empty())
            .map_or_else(|| format!("{platform}_{}", slot.suffix()), str::to_owned);
        let mut component = Component::new(name, kind);
        component.parameters = parameters.unwrap_or_default();
        let info = ComponentInfo::from(&component);
        self.with_platform_mut(scenario_id, platform, |target| {
            target.components.push(component);
        })?;
        self.log(
            "entity.component.added",
            json!({
                "scenario_id": scenario_id,
                "platform": platform,
                "component": info.name,
                "component_type": info.component_type,
            }),
        );
        Ok(info)
    }

    /// Removes every component with exactly this name.
    pub fn remove_component(&self, scenario_id: &str, platform: &str, component: &str) -> Result<bool> {
        let removed = self.with_platform_mut(scenario_id, platform, |target| {
            let before = target.components.len();
            target.components.retain(|existing| existing.name != component);
            target.components.len() < before
        })?;
        if removed {
            self.log(
                "entity.component.removed",
                json!({ "scenario_id": scenario_id, "platform": platform, "component": component }),
            );
        }
        Ok(removed)
    }

    /// Components of one platform in insertion order.
    pub fn list_components(&self, scenario_id: &str, platform: &str) -> Result<Vec<ComponentInfo>> {
        self.scenarios
            .with_scenario(scenario_id, |scenario| {
                scenario
                    .platform(platform)
                    .map(|found| found.components.iter().map(ComponentInfo::from).collect())
                    .ok_or_else(|| platform_not_found(platform, scenario))
            })?
    }

    fn with_platform_mut<T>(
        &self,
        scenario_id: &str,
        name: &str,
        f: impl FnOnce(&mut Platform) -> T,
    ) -> Result<T> {
        self.scenarios
            .with_scenario_mut(scenario_id, |scenario| {
                let label = scenario.name.clone();
                scenario.platform_mut(name).map(f).ok_or_else(|| {
                    AfsimError::NotFound(format!(
                        "Platform '{name}' not found in scenario '{label}'."
                    ))
                })
            })?
    }

    fn log(&self, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(LogLevel::Info, message, metadata);
        }
    }
}

fn platform_not_found(name: &str, scenario: &Scenario) -> AfsimError {
    AfsimError::NotFound(format!(
        "Platform '{name}' not found in scenario '{}'.",
        scenario.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, EntityManager, String) {
        let dir = tempdir().unwrap();
        let scenarios = Arc::new(ScenarioManager::new(dir.path().join("scenarios")).unwrap());
        let id = scenarios.create("ops", "", None, None).unwrap().scenario_id;
        (dir, EntityManager::new(scenarios), id)
    }

    #[test]
    fn platforms_are_unique_by_name() {
        let (_dir, entities, id) = setup();
        let info = entities
            .create_platform(&id, NewPlatform::named("f1").at(35.0, -80.0, 9000.0))
            .unwrap();
        assert_eq!(info.platform_type, "wsf_platform");
        assert_eq!(info.component_count, 0);
        let err = entities
            .create_platform(&id, NewPlatform::named("f1"))
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        assert_eq!(
            entities.create_platform(&id, NewPlatform::named("")).unwrap_err().kind(),
            "invalid_argument"
        );
    }

    #[test]
    fn modify_merges_parameters() {
        let (_dir, entities, id) = setup();
        let mut initial = Params::new();
        initial.insert("side".into(), ParamValue::from("blue"));
        entities
            .create_platform(&id, NewPlatform::named("t1").parameters(initial))
            .unwrap();
        let mut extra = Params::new();
        extra.insert("icon".into(), ParamValue::from("tank"));
        let info = entities
            .modify_platform(
                &id,
                "t1",
                PlatformUpdate {
                    altitude_m: Some(12.5),
                    platform_type: Some("wsf_ground_vehicle".into()),
                    parameters: Some(extra),
                    ..PlatformUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(info.position, Position::new(0.0, 0.0, 12.5));
        assert_eq!(info.platform_type, "wsf_ground_vehicle");
        assert_eq!(info.parameters.len(), 2);
        let err = entities
            .modify_platform(&id, "ghost", PlatformUpdate::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn components_default_by_family() {
        let (_dir, entities, id) = setup();
        entities.create_platform(&id, NewPlatform::named("f1")).unwrap();
        let mover = entities.add_mover(&id, "f1", None, None, None).unwrap();
        let sensor = entities.add_sensor(&id, "f1", None, None, None).unwrap();
        let weapon = entities
            .add_weapon(&id, "f1", Some("wsf_bomb"), Some("gbu"), None)
            .unwrap();
        assert_eq!(mover.name, "f1_mover");
        assert_eq!(mover.component_type, "wsf_route_mover");
        assert_eq!(sensor.component_type, "wsf_radar_sensor");
        assert_eq!(weapon.name, "gbu");
        assert_eq!(weapon.component_type, "wsf_bomb");
        assert_eq!(entities.get_platform(&id, "f1").unwrap().component_count, 3);
    }

    #[test]
    fn removing_one_component_keeps_the_others() {
        let (_dir, entities, id) = setup();
        entities.create_platform(&id, NewPlatform::named("f1")).unwrap();
        entities.add_mover(&id, "f1", None, Some("legs"), None).unwrap();
        entities.add_sensor(&id, "f1", None, Some("eye"), None).unwrap();
        entities.add_weapon(&id, "f1", None, Some("gun"), None).unwrap();
        assert_eq!(entities.list_components(&id, "f1").unwrap().len(), 3);

        assert!(entities.remove_component(&id, "f1", "eye").unwrap());
        let left: Vec<_> = entities
            .list_components(&id, "f1")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(left, vec!["legs", "gun"]);
    }

    #[test]
    fn duplicate_component_names_are_removed_together() {
        let (_dir, entities, id) = setup();
        entities.create_platform(&id, NewPlatform::named("f1")).unwrap();
        entities.add_sensor(&id, "f1", None, Some("eye"), None).unwrap();
        entities
            .add_sensor(&id, "f1", Some("wsf_ir_sensor"), Some("eye"), None)
            .unwrap();
        assert_eq!(entities.list_components(&id, "f1").unwrap().len(), 2);
        assert!(entities.remove_component(&id, "f1", "eye").unwrap());
        assert!(entities.list_components(&id, "f1").unwrap().is_empty());
        assert!(!entities.remove_component(&id, "f1", "eye").unwrap());
    }

    #[test]
    fn missing_platform_is_not_found_but_delete_is_false() {
        let (_dir, entities, id) = setup();
        assert!(!entities.delete_platform(&id, "nobody").unwrap());
        assert_eq!(
            entities.add_mover(&id, "nobody", None, None, None).unwrap_err().kind(),
            "not_found"
        );
        assert_eq!(
            entities.list_components(&id, "nobody").unwrap_err().kind(),
            "not_found"
        );
        assert_eq!(
            entities.list_platforms("no-scenario").unwrap_err().kind(),
            "not_found"
        );
    }

    #[test]
    fn list_keeps_insertion_order() {
        let (_dir, entities, id) = setup();
        for name in ["c", "a", "b"] {
            entities.create_platform(&id, NewPlatform::named(name)).unwrap();
        }
        let names: Vec<_> = entities
            .list_platforms(&id)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(entities.delete_platform(&id, "a").unwrap());
        assert_eq!(entities.list_platforms(&id).unwrap().len(), 2);
    }
}
