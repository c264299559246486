#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! AFSIM scenario authoring and run supervision: scenario model and DSL
//! rendering, platform editing, process-backed simulation runs, result
//! files, AFSIM tool discovery and a JSON-RPC tool surface.

/// Error type shared by the services.
#[path = "../error.rs"]
pub mod error;

/// Free-form parameter values.
#[path = "../params.rs"]
pub mod params;

/// Scenario, platform, component and run records.
#[path = "../models.rs"]
pub mod models;

/// Telemetry for the services.
#[path = "../helper.rs"]
pub mod helper;

/// TOML configuration with environment overrides.
#[path = "../config.rs"]
pub mod config;

/// In-memory scenario registry and persistence.
#[path = "../scenario_manager.rs"]
pub mod scenario_manager;

/// Platform and component editing.
#[path = "../entity_manager.rs"]
pub mod entity_manager;

/// Simulation run lifecycle.
#[path = "../simulation_controller.rs"]
pub mod simulation_controller;

/// Result file scanning and queries.
#[path = "../results.rs"]
pub mod results;

/// AFSIM binary discovery and tool execution.
#[path = "../backend.rs"]
pub mod backend;

/// Prompt-driven scenario generation.
#[path = "../nl_generator.rs"]
pub mod nl_generator;

/// Named tools over the services.
#[path = "../tools.rs"]
pub mod tools;

/// JSON-RPC request handling.
#[path = "../server.rs"]
pub mod server;

/// Service wiring.
#[path = "../main.rs"]
pub mod runtime;

pub use config::ServerConfig;
pub use error::{AfsimError, Result};
pub use helper::{ServiceTelemetry, ServiceTelemetryBuilder};
pub use runtime::{AppState, AppStateBuilder};
pub use server::McpServer;
pub use tools::ToolRouter;
