use std::{collections::HashSet, sync::Arc};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    entity_manager::{EntityManager, NewPlatform},
    error::{AfsimError, Result},
    helper::ServiceTelemetry,
    models::DEFAULT_PLATFORM_TYPE,
    params::format_float,
    scenario_manager::ScenarioManager,
};

const FALLBACK_NAME: &str = "generated_scenario";
const GENERIC_ENTITY: &str = "platform";
/// Upper bound on platforms created for one entity word in a single prompt.
pub const MAX_ENTITY_COUNT: usize = 100;

const ENTITY_WORDS: [&str; 18] = [
    "aircraft",
    "fighter",
    "bomber",
    "drone",
    "uav",
    "helicopter",
    "tank",
    "vehicle",
    "truck",
    "artillery",
    "ship",
    "destroyer",
    "carrier",
    "frigate",
    "submarine",
    "satellite",
    "station",
    "sam",
];

const PLATFORM_TYPES: &[(&str, &str)] = &[
    ("aircraft", "wsf_air_vehicle"),
    ("fighter", "wsf_air_vehicle"),
    ("bomber", "wsf_air_vehicle"),
    ("drone", "wsf_air_vehicle"),
    ("uav", "wsf_air_vehicle"),
    ("helicopter", "wsf_air_vehicle"),
    ("tank", "wsf_ground_vehicle"),
    ("vehicle", "wsf_ground_vehicle"),
    ("truck", "wsf_ground_vehicle"),
    ("artillery", "wsf_ground_vehicle"),
    ("ship", "wsf_surface_ship"),
    ("destroyer", "wsf_surface_ship"),
    ("carrier", "wsf_surface_ship"),
    ("frigate", "wsf_surface_ship"),
    ("submarine", "wsf_subsurface_vehicle"),
    ("missile", "wsf_missile"),
    ("sam", "wsf_ground_vehicle"),
    ("satellite", "wsf_satellite"),
    ("station", "wsf_ground_station"),
];

const MOVER_KEYWORDS: &[(&str, &str)] = &[
    ("fixed", "wsf_fixed_mover"),
    ("stationary", "wsf_fixed_mover"),
    ("route", "wsf_route_mover"),
    ("patrol", "wsf_route_mover"),
    ("air", "wsf_air_mover"),
    ("fly", "wsf_air_mover"),
    ("ground", "wsf_ground_mover"),
    ("drive", "wsf_ground_mover"),
    ("surface", "wsf_surface_mover"),
    ("sail", "wsf_surface_mover"),
    ("subsurface", "wsf_subsurface_mover"),
    ("dive", "wsf_subsurface_mover"),
    ("orbit", "wsf_orbit_mover"),
];

const MOVER_DEFAULTS: &[(&str, &str)] = &[
    ("aircraft", "wsf_air_mover"),
    ("fighter", "wsf_air_mover"),
    ("bomber", "wsf_air_mover"),
    ("drone", "wsf_air_mover"),
    ("uav", "wsf_air_mover"),
    ("helicopter", "wsf_air_mover"),
    ("ship", "wsf_surface_mover"),
    ("destroyer", "wsf_surface_mover"),
    ("carrier", "wsf_surface_mover"),
    ("frigate", "wsf_surface_mover"),
    ("submarine", "wsf_subsurface_mover"),
    ("satellite", "wsf_orbit_mover"),
];

const SENSOR_KEYWORDS: &[(&str, &str)] = &[
    ("radar", "wsf_radar_sensor"),
    ("ew", "wsf_radar_sensor"),
    ("eo", "wsf_eo_sensor"),
    ("camera", "wsf_eo_sensor"),
    ("optical", "wsf_eo_sensor"),
    ("ir", "wsf_ir_sensor"),
    ("infrared", "wsf_ir_sensor"),
    ("comm", "wsf_comm_sensor"),
    ("comms", "wsf_comm_sensor"),
    ("communications", "wsf_comm_sensor"),
];

const WEAPON_KEYWORDS: &[(&str, &str)] = &[
    ("missile", "wsf_missile"),
    ("missiles", "wsf_missile"),
    ("sam", "wsf_missile"),
    ("aam", "wsf_missile"),
    ("bomb", "wsf_bomb"),
    ("bombs", "wsf_bomb"),
    ("gun", "wsf_bullet"),
    ("guns", "wsf_bullet"),
    ("cannon", "wsf_bullet"),
    ("bullet", "wsf_bullet"),
];

const ALTITUDES: &[(&str, f64)] = &[
    ("aircraft", 10_000.0),
    ("fighter", 10_000.0),
    ("bomber", 12_000.0),
    ("drone", 3000.0),
    ("uav", 3000.0),
    ("helicopter", 1000.0),
    ("satellite", 400_000.0),
];

const NUMBER_WORDS: [(&str, &str); 10] = [
    ("one", "1"),
    ("two", "2"),
    ("three", "3"),
    ("four", "4"),
    ("five", "5"),
    ("six", "6"),
    ("seven", "7"),
    ("eight", "8"),
    ("nine", "9"),
    ("ten", "10"),
];

/// Result of [`NlGenerator::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedScenario {
    /// Id of the registered scenario.
    pub scenario_id: String,
    /// Derived scenario name.
    pub name: String,
    /// Number of created platforms.
    pub platform_count: usize,
    /// Names of created platforms.
    pub platforms: Vec<String>,
    /// Parsed duration.
    pub duration_s: f64,
    /// Heuristic fallbacks that were applied.
    pub warnings: Vec<String>,
    /// Scenario text.
    pub afsim_preview: String,
}

/// Result of [`NlGenerator::refine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementReport {
    /// Refined scenario.
    pub scenario_id: String,
    /// Human-readable change list.
    pub changes: Vec<String>,
    /// Platform count afterwards.
    pub platform_count: usize,
}

struct Patterns {
    name: Regex,
    number_word: Regex,
    entity: Regex,
    hours: Regex,
    minutes: Regex,
    seconds: Regex,
    add: Regex,
    word: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|err| AfsimError::Config(format!("bad pattern {pattern}: {err}")))
        };
        Ok(Self {
            name: build(r"^[a-z0-9 _-]{3,40}")?,
            number_word: build(r"\b(one|two|three|four|five|six|seven|eight|nine|ten)\b")?,
            entity: build(&format!(
                r"\b(?:(\d+)\s+)?({})s?\b",
                ENTITY_WORDS.join("|")
            ))?,
            hours: build(r"(\d+(?:\.\d+)?)\s*(?:hours?|hrs?)\b")?,
            minutes: build(r"(\d+(?:\.\d+)?)\s*(?:minutes?|mins?)\b")?,
            seconds: build(r"(\d+(?:\.\d+)?)\s*(?:seconds?|secs?)\b")?,
            add: build(r"\badd\s+(?:(\d+)\s+)?(?:more\s+)?(?:an?\s+)?([a-z]+)")?,
            word: build(r"[a-z0-9]+")?,
        })
    }
}

/// Keyword-driven scenario generation on top of the scenario and entity managers.
pub struct NlGenerator {
    scenarios: Arc<ScenarioManager>,
    entities: EntityManager,
    patterns: Patterns,
    telemetry: Option<ServiceTelemetry>,
}

impl std::fmt::Debug for NlGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NlGenerator").finish_non_exhaustive()
    }
}

impl NlGenerator {
    /// Creates a generator sharing the given registries.
    pub fn new(scenarios: Arc<ScenarioManager>, entities: EntityManager) -> Result<Self> {
        Ok(Self {
            scenarios,
            entities,
            patterns: Patterns::compile()?,
            telemetry: None,
        })
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds and registers a scenario from a free-text prompt.
    pub fn generate(&self, prompt: &str) -> Result<GeneratedScenario> {
        let lower = prompt.to_lowercase();
        let normalized = self.normalize_numbers(&lower);
        let name = self.derive_name(&lower);
        let duration_s = self.extract_duration(&normalized).unwrap_or(3600.0);
        let description: String = prompt.chars().take(200).collect();
        let scenario = self.scenarios.create(
            &name,
            &format!("Auto-generated from prompt: {description}"),
            Some(duration_s),
            Some(1.0),
        )?;
        let id = scenario.scenario_id;

        let mut counts: IndexMap<String, usize> = IndexMap::new();
        for caps in self.patterns.entity.captures_iter(&normalized) {
            let count = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(1);
            if let Some(word) = caps.get(2) {
                let total = counts.entry(word.as_str().to_owned()).or_insert(0);
                *total = total.saturating_add(count);
            }
        }

        let mut warnings = Vec::new();
        for (entity, count) in &mut counts {
            if *count > MAX_ENTITY_COUNT {
                warnings.push(format!(
                    "Requested {count} {entity} platforms; capped at {MAX_ENTITY_COUNT}."
                ));
                *count = MAX_ENTITY_COUNT;
            }
        }
        if counts.is_empty() {
            warnings.push(
                "No recognisable platform types found in prompt; creating a default scenario with one generic platform."
                    .to_owned(),
            );
            counts.insert(GENERIC_ENTITY.to_owned(), 1);
        }

        let words = self.words(&normalized);
        let sensor = lookup_first(&words, SENSOR_KEYWORDS);
        let weapon = lookup_first(&words, WEAPON_KEYWORDS);
        let mut created = Vec::new();
        for (entity, count) in &counts {
            let mover = infer_mover(entity, &words);
            for index in 1..=*count {
                let platform = if *count > 1 {
                    format!("{entity}_{index}")
                } else {
                    entity.clone()
                };
                let offset = 0.1 * index as f64;
                self.entities.create_platform(
                    &id,
                    NewPlatform::named(&platform)
                        .platform_type(platform_type_for(entity))
                        .at(35.0 + offset, -80.0 + offset, altitude_for(entity)),
                )?;
                self.entities.add_mover(&id, &platform, Some(mover), None, None)?;
                if let Some(sensor) = sensor {
                    self.entities.add_sensor(&id, &platform, Some(sensor), None, None)?;
                }
                if let Some(weapon) = weapon.filter(|_| !matches!(entity.as_str(), "station" | "satellite")) {
                    self.entities.add_weapon(&id, &platform, Some(weapon), None, None)?;
                }
                created.push(platform);
            }
        }

        let afsim_preview = self.scenarios.with_scenario(&id, |s| s.to_afsim())?;
        self.log(
            "nl.generated",
            json!({ "scenario_id": id, "name": name, "platforms": created.len(), "warnings": warnings.len() }),
        );
        Ok(GeneratedScenario {
            scenario_id: id,
            name,
            platform_count: created.len(),
            platforms: created,
            duration_s,
            warnings,
            afsim_preview,
        })
    }

    /// Applies a follow-up prompt: duration changes and `add [N] [more] <entity>`.
    pub fn refine(&self, scenario_id: &str, prompt: &str) -> Result<RefinementReport> {
        let current_duration = self.scenarios.with_scenario(scenario_id, |s| s.duration_s)?;
        let normalized = self.normalize_numbers(&prompt.to_lowercase());
        let mut changes = Vec::new();

        let wants_duration = ["extend", "duration", "last", "run for"]
            .iter()
            .any(|kw| normalized.contains(kw));
        if wants_duration {
            if let Some(duration) = self.extract_duration(&normalized) {
                if (duration - current_duration).abs() > f64::EPSILON {
                    self.scenarios
                        .with_scenario_mut(scenario_id, |s| s.duration_s = duration)?;
                    changes.push(format!("Duration updated to {}s", format_float(duration)));
                }
            }
        }

        if let Some(caps) = self.patterns.add.captures(&normalized) {
            let count = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(1);
            let entity = caps.get(2).map_or(GENERIC_ENTITY, |m| m.as_str());
            let entity = singular(entity);
            if count > MAX_ENTITY_COUNT {
                changes.push(format!(
                    "Requested {count} {entity} platforms; capped at {MAX_ENTITY_COUNT}"
                ));
            }
            let count = count.min(MAX_ENTITY_COUNT);
            let words = self.words(&normalized);
            let mover = infer_mover(entity, &words);
            let mut taken: HashSet<String> = self
                .entities
                .list_platforms(scenario_id)?
                .into_iter()
                .map(|p| p.name)
                .collect();
            let mut next = taken.len() + 1;
            for index in 1..=count {
                while taken.contains(&format!("{entity}_{next}")) {
                    next += 1;
                }
                let platform = format!("{entity}_{next}");
                self.entities.create_platform(
                    scenario_id,
                    NewPlatform::named(&platform)
                        .platform_type(platform_type_for(entity))
                        .at(36.0 + 0.1 * index as f64, -80.0, altitude_for(entity)),
                )?;
                self.entities
                    .add_mover(scenario_id, &platform, Some(mover), None, None)?;
                changes.push(format!("Added platform '{platform}'"));
                taken.insert(platform);
            }
        }

        if changes.is_empty() {
            changes.push("No changes applied (prompt not recognised).".to_owned());
        }
        let platform_count = self.scenarios.with_scenario(scenario_id, |s| s.platforms.len())?;
        self.log(
            "nl.refined",
            json!({ "scenario_id": scenario_id, "changes": changes.len() }),
        );
        Ok(RefinementReport {
            scenario_id: scenario_id.to_owned(),
            changes,
            platform_count,
        })
    }

    fn normalize_numbers(&self, text: &str) -> String {
        self.patterns
            .number_word
            .replace_all(text, |caps: &regex::Captures<'_>| {
                NUMBER_WORDS
                    .iter()
                    .find(|(word, _)| *word == &caps[1])
                    .map_or_else(|| caps[1].to_owned(), |(_, digit)| (*digit).to_owned())
            })
            .into_owned()
    }

    fn derive_name(&self, lower: &str) -> String {
        let name: String = self
            .patterns
            .name
            .find(lower)
            .map(|m| m.as_str().trim().replace(' ', "_"))
            .unwrap_or_default()
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect();
        if name.is_empty() {
            FALLBACK_NAME.to_owned()
        } else {
            name
        }
    }

    fn extract_duration(&self, text: &str) -> Option<f64> {
        let grab = |re: &Regex| {
            re.captures(text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        };
        grab(&self.patterns.hours)
            .map(|h| h * 3600.0)
            .or_else(|| grab(&self.patterns.minutes).map(|m| m * 60.0))
            .or_else(|| grab(&self.patterns.seconds))
    }

    fn words<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.patterns
            .word
            .find_iter(text)
            .map(|m| m.as_str())
            .collect()
    }

    fn log(&self, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(LogLevel::Info, message, metadata);
        }
    }
}

fn lookup<T: Copy>(table: &[(&str, T)], key: &str) -> Option<T> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, value)| *value)
}

/// First table entry, in table order, whose keyword appears as a whole word.
fn lookup_first(words: &[&str], table: &[(&str, &'static str)]) -> Option<&'static str> {
    table
        .iter()
        .find(|(keyword, _)| words.contains(keyword))
        .map(|(_, value)| *value)
}

fn infer_mover(entity: &str, words: &[&str]) -> &'static str {
    let mut combined = vec![entity];
    combined.extend_from_slice(words);
    lookup_first(&combined, MOVER_KEYWORDS)
        .or_else(|| lookup(MOVER_DEFAULTS, entity))
        .unwrap_or("wsf_route_mover")
}

fn platform_type_for(entity: &str) -> &'static str {
    lookup(PLATFORM_TYPES, entity).unwrap_or(DEFAULT_PLATFORM_TYPE)
}

fn altitude_for(entity: &str) -> f64 {
    lookup(ALTITUDES, entity).unwrap_or(0.0)
}

fn singular(word: &str) -> &str {
    if lookup(PLATFORM_TYPES, word).is_some() {
        return word;
    }
    word.strip_suffix('s')
        .filter(|stem| lookup(PLATFORM_TYPES, stem).is_some())
        .unwrap_or(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn generator() -> (tempfile::TempDir, Arc<ScenarioManager>, NlGenerator) {
        let dir = tempdir().unwrap();
        let scenarios = Arc::new(ScenarioManager::new(dir.path().join("scenarios")).unwrap());
        let entities = EntityManager::new(Arc::clone(&scenarios));
        let nl = NlGenerator::new(Arc::clone(&scenarios), entities).unwrap();
        (dir, scenarios, nl)
    }

    #[test]
    fn generates_platforms_with_counts_and_components() {
        let (_dir, scenarios, nl) = generator();
        let out = nl
            .generate("Two fighters with radar and missiles escort a bomber for 2 hours")
            .unwrap();
        assert_eq!(out.duration_s, 7200.0);
        assert_eq!(out.platforms, vec!["fighter_1", "fighter_2", "bomber"]);
        assert!(out.warnings.is_empty());

        let scenario = scenarios.get(&out.scenario_id).unwrap();
        let fighter = scenario.platform("fighter_2").unwrap();
        assert_eq!(fighter.platform_type, "wsf_air_vehicle");
        assert!((fighter.position.latitude - 35.2).abs() < 1e-9);
        assert_eq!(fighter.position.altitude_m, 10_000.0);
        let kinds: Vec<_> = fighter.components.iter().map(|c| c.kind.tag()).collect();
        assert_eq!(kinds, vec!["wsf_air_mover", "wsf_radar_sensor", "wsf_missile"]);
        assert!(out.afsim_preview.contains("platform bomber"));
    }

    #[test]
    fn number_words_must_be_whole_words() {
        let (_dir, _scenarios, nl) = generator();
        // "often" contains "ten" and "someone" contains "one".
        let out = nl.generate("someone often sees a tank").unwrap();
        assert_eq!(out.platforms, vec!["tank"]);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let (_dir, scenarios, nl) = generator();
        // "their" contains "ir", "repair" contains "air".
        let out = nl.generate("their ship needs repair").unwrap();
        let scenario = scenarios.get(&out.scenario_id).unwrap();
        let ship = scenario.platform("ship").unwrap();
        let kinds: Vec<_> = ship.components.iter().map(|c| c.kind.tag()).collect();
        assert_eq!(kinds, vec!["wsf_surface_mover"]);
    }

    #[test]
    fn unknown_prompt_falls_back_to_generic_platform() {
        let (_dir, scenarios, nl) = generator();
        let out = nl.generate("!!").unwrap();
        assert_eq!(out.name, FALLBACK_NAME);
        assert_eq!(out.platforms, vec!["platform"]);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.duration_s, 3600.0);
        let scenario = scenarios.get(&out.scenario_id).unwrap();
        assert_eq!(scenario.platforms[0].platform_type, "wsf_platform");
    }

    #[test]
    fn entity_counts_are_capped_with_a_warning() {
        let (_dir, scenarios, nl) = generator();
        let out = nl.generate("100000 tanks and a truck").unwrap();
        assert_eq!(out.platform_count, MAX_ENTITY_COUNT + 1);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("capped at 100"));
        let scenario = scenarios.get(&out.scenario_id).unwrap();
        assert!(scenario.platform("tank_100").is_some());
        assert!(scenario.platform("tank_101").is_none());

        let report = nl.refine(&out.scenario_id, "add 500 more tanks").unwrap();
        assert_eq!(report.platform_count, 2 * MAX_ENTITY_COUNT + 1);
        assert!(report.changes[0].contains("capped"));
    }

    #[test]
    fn name_comes_from_leading_prompt_text() {
        let (_dir, _scenarios, nl) = generator();
        let out = nl.generate("Coastal defense: three ships").unwrap();
        assert_eq!(out.name, "coastal_defense");
        assert_eq!(out.platform_count, 3);
    }

    #[test]
    fn refine_adds_unique_platforms_and_extends_duration() {
        let (_dir, scenarios, nl) = generator();
        let out = nl.generate("a fighter patrol").unwrap();
        let report = nl
            .refine(&out.scenario_id, "extend to 90 minutes and add 2 more fighters")
            .unwrap();
        assert_eq!(report.platform_count, 3);
        assert!(report.changes.contains(&"Duration updated to 5400.0s".to_owned()));
        assert!(report.changes.contains(&"Added platform 'fighter_2'".to_owned()));
        assert!(report.changes.contains(&"Added platform 'fighter_3'".to_owned()));
        let scenario = scenarios.get(&out.scenario_id).unwrap();
        assert_eq!(scenario.duration_s, 5400.0);

        let again = nl.refine(&out.scenario_id, "add two fighters").unwrap();
        assert_eq!(again.platform_count, 5);
        let report = scenarios.validate(&out.scenario_id).unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn refine_without_match_reports_no_change() {
        let (_dir, _scenarios, nl) = generator();
        let out = nl.generate("a tank").unwrap();
        let report = nl.refine(&out.scenario_id, "make it nicer").unwrap();
        assert_eq!(
            report.changes,
            vec!["No changes applied (prompt not recognised).".to_owned()]
        );
        assert_eq!(nl.refine("missing", "add a tank").unwrap_err().kind(), "not_found");
    }
}
