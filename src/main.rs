//! Agent message broker command line
//!
//! `run` hosts a broker (optionally with the HTTP stats endpoint) until
//! interrupted, `demo` exercises every messaging pattern against sample
//! agents, and `config` validates a configuration file.

use agent_broker::observability::init_default_logging;
use agent_broker::protocol::{
    create_broadcast_message, create_request_message, into_payload, AgentIdentity, Priority,
};
use agent_broker::{
    handler_fn, sync_handler_fn, AgentMessage, BrokerConfig, MessageBroker, MessageType,
    StatsServer,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// In-process agent message broker
#[derive(Parser)]
#[command(name = "agent-broker")]
#[command(about = "In-process agent message broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a broker and wait for Ctrl-C
    Run {
        /// Serve statistics over HTTP on this port
        #[arg(long, env = "STATS_PORT")]
        stats_port: Option<u16>,
    },
    /// Register sample agents and exercise every messaging pattern
    Demo,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { stats_port } => run_broker(config, stats_port).await,
        Commands::Demo => run_demo(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<BrokerConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BrokerConfig::load_from_file(path)?);
    }

    for candidate in ["broker.toml", "config/broker.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BrokerConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(BrokerConfig::default())
}

async fn run_broker(config: BrokerConfig, stats_port: Option<u16>) -> CliResult<()> {
    let broker = MessageBroker::new(config)?;
    broker.start().await?;

    let stats_task = stats_port.map(|port| tokio::spawn(StatsServer::new(broker.clone(), port).start()));

    info!("Broker running, press Ctrl-C to stop");
    wait_for_shutdown_signal().await?;

    info!("Shutdown initiated");
    broker.stop().await;
    if let Some(task) = stats_task {
        task.abort();
    }

    let stats = broker.stats();
    info!(
        sent = stats.messages_sent,
        delivered = stats.messages_delivered,
        dead_letters = stats.dead_letters,
        "Broker shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> CliResult<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> CliResult<()> {
    signal::ctrl_c().await?;
    Ok(())
}

async fn run_demo(config: BrokerConfig) -> CliResult<()> {
    let broker = MessageBroker::new(config)?;

    let planner = AgentIdentity::new("planner", "supervisor");
    let calculator = AgentIdentity::new("calculator", "worker").with_capabilities(["math"]);
    let archivist = AgentIdentity::new("archivist", "worker");

    broker.register(
        planner.clone(),
        sync_handler_fn(|message| {
            info!(from = %message.sender().agent_id, kind = %message.message_type(), "planner received");
            Ok(None)
        }),
    )?;
    broker.register(
        calculator.clone(),
        handler_fn(|message: AgentMessage| async move {
            let x = message.payload().get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Some(into_payload(json!({ "y": x * 2 }))))
        }),
    )?;
    broker.register(
        archivist.clone(),
        sync_handler_fn(|message| {
            info!(payload = %serde_json::Value::Object(message.payload().clone()), "archivist stored");
            Ok(None)
        }),
    )?;

    broker.subscribe("calculator", "results")?;
    broker.subscribe("archivist", "results")?;
    broker.start().await?;

    let request = create_request_message(&planner, &calculator, json!({ "x": 21 }));
    let reply = broker.send_request(request, Duration::from_secs(5)).await?;
    println!("request/response: {}", serde_json::Value::Object(reply));

    let recipients = broker.publish("results", &planner, json!({ "answer": 42 })).await?;
    println!("published to {recipients} subscribers");

    broker.send(create_broadcast_message(&planner, json!({ "notice": "demo" }))).await;

    let urgent = AgentMessage::builder(planner.clone(), MessageType::StatusUpdate)
        .recipient(archivist.clone())
        .priority(Priority::Urgent)
        .payload(json!({ "alert": "disk almost full" }))
        .build();
    broker.send(urgent).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.stop().await;

    println!("{}", serde_json::to_string_pretty(&broker.stats())?);
    Ok(())
}

fn handle_config_command(config: &BrokerConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    println!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
