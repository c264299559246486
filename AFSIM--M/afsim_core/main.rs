use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use shared_event_bus::{EventPublisher, FileEventPublisher, MemoryEventBus};
use shared_logging::{JsonLogger, LogLevel};

use crate::{
    backend::AfsimBackend,
    config::ServerConfig,
    entity_manager::EntityManager,
    helper::ServiceTelemetry,
    nl_generator::NlGenerator,
    results::ResultsHandler,
    scenario_manager::ScenarioManager,
    simulation_controller::SimulationController,
};

const EVENT_BACKLOG: usize = 256;

/// Every service the tool surface dispatches to, wired from one [`ServerConfig`].
#[derive(Debug)]
pub struct AppState {
    config: ServerConfig,
    scenarios: Arc<ScenarioManager>,
    entities: EntityManager,
    simulations: SimulationController,
    results: ResultsHandler,
    backend: AfsimBackend,
    generator: NlGenerator,
    telemetry: Option<ServiceTelemetry>,
}

impl AppState {
    /// Returns a builder.
    #[must_use]
    pub fn builder(config: ServerConfig) -> AppStateBuilder {
        AppStateBuilder {
            config,
            telemetry: None,
        }
    }

    /// Telemetry described by the `[logging]` table and `event_log`.
    ///
    /// Logs go to the configured file or stderr. Events go to the event log
    /// file when set, otherwise to an in-memory bus.
    pub fn telemetry_from_config(config: &ServerConfig) -> Result<ServiceTelemetry> {
        let level = config.log_level()?;
        let logger = match &config.logging.file {
            Some(path) => JsonLogger::new(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
            None => JsonLogger::stderr(),
        }
        .with_min_level(level);
        let publisher: Arc<dyn EventPublisher> = match &config.event_log {
            Some(path) => Arc::new(
                FileEventPublisher::new(path)
                    .with_context(|| format!("failed to prepare event log {}", path.display()))?,
            ),
            None => Arc::new(MemoryEventBus::new(EVENT_BACKLOG)),
        };
        ServiceTelemetry::builder("afsim-mcp")
            .logger(Arc::new(logger))
            .event_publisher(publisher)
            .build()
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Scenario registry.
    #[must_use]
    pub fn scenarios(&self) -> &ScenarioManager {
        &self.scenarios
    }

    /// Platform and component editing.
    #[must_use]
    pub const fn entities(&self) -> &EntityManager {
        &self.entities
    }

    /// Run supervision.
    #[must_use]
    pub const fn simulations(&self) -> &SimulationController {
        &self.simulations
    }

    /// Result file access.
    #[must_use]
    pub const fn results(&self) -> &ResultsHandler {
        &self.results
    }

    /// AFSIM tool discovery and execution.
    #[must_use]
    pub const fn backend(&self) -> &AfsimBackend {
        &self.backend
    }

    /// Prompt-driven scenario generation.
    #[must_use]
    pub const fn generator(&self) -> &NlGenerator {
        &self.generator
    }

    /// Root telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> Option<&ServiceTelemetry> {
        self.telemetry.as_ref()
    }

    /// Waits for events still being published by any service.
    pub async fn flush_events(&self) {
        if let Some(tel) = &self.telemetry {
            tel.flush().await;
        }
    }
}

/// Builder for [`AppState`].
#[derive(Debug)]
pub struct AppStateBuilder {
    config: ServerConfig,
    telemetry: Option<ServiceTelemetry>,
}

impl AppStateBuilder {
    /// Sets telemetry; each service gets a scoped copy.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Creates the directories and wires the services.
    pub fn build(self) -> Result<AppState> {
        let config = self.config;
        let telemetry = self.telemetry;
        let scoped = |module: &str| telemetry.as_ref().map(|tel| tel.scoped(module));

        let mut scenarios = ScenarioManager::new(config.scenarios_dir())
            .context("failed to prepare scenarios directory")?;
        if let Some(tel) = scoped("scenario-manager") {
            scenarios = scenarios.with_telemetry(tel);
        }
        let scenarios = Arc::new(scenarios);

        let mut entities = EntityManager::new(Arc::clone(&scenarios));
        if let Some(tel) = scoped("entity-manager") {
            entities = entities.with_telemetry(tel);
        }

        let mut simulations = SimulationController::new(Arc::clone(&scenarios), config.output_dir())
            .context("failed to prepare run output directory")?
            .with_executable(config.afsim_binary.clone());
        if let Some(tel) = scoped("simulation-controller") {
            simulations = simulations.with_telemetry(tel);
        }

        let mut results = ResultsHandler::new(config.output_dir());
        if let Some(tel) = scoped("results") {
            results = results.with_telemetry(tel);
        }

        let mut backend = AfsimBackend::new(config.afsim_home.clone())
            .with_timeout(Duration::from_secs(config.tool_timeout_secs));
        if let Some(tel) = scoped("backend") {
            backend = backend.with_telemetry(tel);
        }

        let generator_entities = EntityManager::new(Arc::clone(&scenarios));
        let mut generator = NlGenerator::new(Arc::clone(&scenarios), generator_entities)
            .context("failed to compile prompt patterns")?;
        if let Some(tel) = scoped("nl-generator") {
            generator = generator.with_telemetry(tel);
        }

        if let Some(tel) = &telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "server.state.ready",
                json!({
                    "scenarios_dir": scenarios.scenarios_dir().display().to_string(),
                    "output_dir": simulations.output_root().display().to_string(),
                    "afsim_binary": config.afsim_binary.as_ref().map(|p| p.display().to_string()),
                }),
            );
        }

        Ok(AppState {
            config,
            scenarios,
            entities,
            simulations,
            results,
            backend,
            generator,
            telemetry,
        })
    }
}
