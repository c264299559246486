use std::{path::PathBuf, sync::Arc};

use afsim_core::{
    config::ServerConfig,
    runtime::AppState,
    server::McpServer,
    tools::{self, ToolRouter},
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    runtime::Runtime,
};

#[derive(Parser, Debug)]
#[command(name = "afsim-mcp", version, about = "AFSIM scenario and simulation tool server")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Root for scenarios and run outputs.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Executable launched by run_simulation.
    #[arg(long, global = true)]
    afsim_binary: Option<PathBuf>,
    /// AFSIM installation root.
    #[arg(long, global = true)]
    afsim_home: Option<PathBuf>,
    /// Minimum log level (debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Log file; stderr when omitted.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// JSON-lines file receiving lifecycle events.
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serves newline-delimited JSON-RPC on stdin/stdout (default).
    Serve,
    /// Prints the tool catalogue.
    Tools,
    /// Runs one tool and prints its JSON result.
    Call {
        /// Tool name.
        name: String,
        /// JSON object with the tool arguments.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&tools::specs())?);
            Ok(())
        }
        Commands::Call { name, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let runtime = Runtime::new()?;
            let router = ToolRouter::new(Arc::new(build_state(config)?));
            let result = runtime.block_on(async {
                let result = router.call(&name, &arguments).await;
                router.state().flush_events().await;
                result
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Serve => {
            let runtime = Runtime::new()?;
            let server = McpServer::new(ToolRouter::new(Arc::new(build_state(config)?)));
            runtime.block_on(serve(&server))
        }
    }
}

/// File, then environment, then command-line flags.
fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;
    apply_flags(&mut config, cli)?;
    Ok(config)
}

fn apply_flags(config: &mut ServerConfig, cli: &Cli) -> Result<()> {
    if let Some(dir) = &cli.state_dir {
        config.state_dir.clone_from(dir);
    }
    if let Some(binary) = &cli.afsim_binary {
        config.afsim_binary = Some(binary.clone());
    }
    if let Some(home) = &cli.afsim_home {
        config.afsim_home = Some(home.clone());
    }
    if let Some(level) = &cli.log_level {
        level
            .parse::<LogLevel>()
            .with_context(|| format!("--log-level {level}"))?;
        config.logging.level.clone_from(level);
    }
    if let Some(file) = &cli.log_file {
        config.logging.file = Some(file.clone());
    }
    if let Some(events) = &cli.event_log {
        config.event_log = Some(events.clone());
    }
    Ok(())
}

fn build_state(config: ServerConfig) -> Result<AppState> {
    let telemetry = AppState::telemetry_from_config(&config)?;
    AppState::builder(config).telemetry(telemetry).build()
}

async fn serve(server: &McpServer) -> Result<()> {
    if let Some(tel) = server.router().state().telemetry() {
        let _ = tel.log(LogLevel::Info, "server.started", json!({ "transport": "stdio" }));
    }
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = server.handle_line(line).await {
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            stdout.write_all(&encoded).await?;
            stdout.flush().await?;
        }
    }
    let state = server.router().state();
    state.flush_events().await;
    if let Some(tel) = state.telemetry() {
        let _ = tel.log(LogLevel::Info, "server.stopped", json!({}));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            "state_dir = \"state\"\nafsim_binary = \"/opt/afsim/bin/mission\"\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "afsim-mcp",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "warn",
            "--afsim-binary",
            "/usr/local/bin/mission",
            "tools",
        ])
        .unwrap();
        let mut config = ServerConfig::load(cli.config.as_ref().unwrap()).unwrap();
        apply_flags(&mut config, &cli).unwrap();
        assert_eq!(config.state_dir, dir.path().join("state"));
        assert_eq!(config.logging.level, "warn");
        assert_eq!(
            config.afsim_binary,
            Some(PathBuf::from("/usr/local/bin/mission"))
        );
        assert!(matches!(cli.command, Some(Commands::Tools)));
    }

    #[test]
    fn rejects_unknown_log_level_flag() {
        let cli = Cli::try_parse_from(["afsim-mcp", "--log-level", "loud"]).unwrap();
        let mut config = ServerConfig::default();
        assert!(apply_flags(&mut config, &cli).is_err());
        assert!(cli.command.is_none());
    }

    #[test]
    fn call_subcommand_parses_arguments() {
        let cli = Cli::try_parse_from([
            "afsim-mcp",
            "call",
            "create_scenario",
            "--args",
            "{\"name\":\"cli\"}",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Call { name, args }) => {
                assert_eq!(name, "create_scenario");
                let parsed: Value = serde_json::from_str(&args).unwrap();
                assert_eq!(parsed["name"], json!("cli"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
