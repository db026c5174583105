use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaybus_core::{Handler, RequestContext, Value};
use relaybus_server::{
    build_invocation_service, logging, BusConfig, Components, Engine, EngineConfig, HttpConfig,
    HttpTransport, Invocation,
};
use tower::ServiceExt;

#[derive(Parser)]
#[command(name = "relaybus", version, about = "Declarative pipeline runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true, env = "RELAYBUS_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one invocation and print its JSON result
    Invoke {
        /// Path to the bus YAML file
        #[arg(long)]
        bus: PathBuf,
        /// Operation as `Interface::Operation`
        handler: Handler,
        /// Input as JSON (default `{}`)
        input: Option<String>,
    },
    /// Serve the HTTP RPC transport until Ctrl-C
    Serve {
        /// Path to the bus YAML file
        #[arg(long)]
        bus: PathBuf,
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8080", env = "RELAYBUS_ADDRESS")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Invoke { bus, handler, input } => invoke(&bus, handler, input.as_deref()).await,
        Commands::Serve { bus, address } => serve(&bus, address).await,
    }
}

fn load(bus: &Path) -> anyhow::Result<Arc<Engine>> {
    let config = BusConfig::load(bus)?;
    let engine = Engine::load(&config, Components::with_defaults()?)
        .with_context(|| format!("loading {}", bus.display()))?;
    Ok(engine)
}

async fn invoke(bus: &Path, handler: Handler, input: Option<&str>) -> anyhow::Result<()> {
    let input: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(raw).context("input is not valid JSON")?,
        None => serde_json::json!({}),
    };
    let engine = load(bus)?;
    let service = build_invocation_service(Arc::clone(&engine), &EngineConfig::default());
    let ctx = RequestContext::new(uuid::Uuid::new_v4().to_string());

    let result = service
        .oneshot(Invocation::new(ctx, handler, Value::from(input)))
        .await;
    engine.close().await?;

    let output: serde_json::Value = result?.into();
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn serve(bus: &Path, address: String) -> anyhow::Result<()> {
    let engine = load(bus)?;
    let mut transport = HttpTransport::new(
        engine,
        HttpConfig {
            address,
            ..HttpConfig::default()
        },
    );
    let addr = transport.start().await?;
    tracing::info!(%addr, "serving");
    transport
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
        })
        .await
}
