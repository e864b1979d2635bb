//! Patchbay CLI — the main entry point.
//!
//! Commands:
//! - `serve`    — Start the HTTP gateway
//! - `route`    — Route a protocol message from JSON
//! - `ask`      — Route natural language through the intent analyzer
//! - `analyze`  — Show the intent plan for a prompt without routing
//! - `catalog`  — Print the capability catalog
//! - `status`   — Print the registry snapshot

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use patchbay_runtime::{Runtime, RuntimeOptions};

#[derive(Parser)]
#[command(
    name = "patchbay",
    about = "Patchbay — a local agent-capability router",
    version,
    long_about = "Patchbay routes protocol messages and natural-language prompts to \
                  dynamically registered capability providers, with approval-gated \
                  mutations, durable async execution, and SSE streaming."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Bind host (e.g. 0.0.0.0 for containers)
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Bind port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Route a protocol message given as a JSON string
    Route {
        /// The message JSON
        message: String,
    },

    /// Route natural language through the intent analyzer
    Ask {
        /// The prompt text
        text: String,

        /// Approve any confirmation-gated mutation up front
        #[arg(long)]
        confirm: bool,
    },

    /// Analyze a prompt without routing it
    Analyze {
        /// The prompt text
        text: String,
    },

    /// Print the capability catalog
    Catalog,

    /// Print the registry snapshot with health
    Status,
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let runtime = Runtime::new(RuntimeOptions::default()).context("runtime startup failed")?;

    match cli.command {
        Commands::Serve { host, port } => {
            let report = runtime.bootstrap().await;
            if let Some(notice) = report.get("provider_notice").and_then(Value::as_str) {
                tracing::info!(notice = %notice, "Provider selection");
            }
            patchbay_gateway::serve(runtime, &host, port)
                .await
                .context("gateway failed")?;
        }

        Commands::Route { message } => {
            let value: Value = serde_json::from_str(&message).context("message is not valid JSON")?;
            let response = runtime.route(value).await;
            print_json(&serde_json::to_value(response)?);
        }

        Commands::Ask { text, confirm } => {
            let outcome = runtime.route_nl(&text, confirm, None, None).await;
            print_json(&serde_json::to_value(outcome)?);
        }

        Commands::Analyze { text } => {
            let plan = runtime.analyze(&text, None).await;
            print_json(&serde_json::to_value(plan)?);
        }

        Commands::Catalog => {
            print_json(&runtime.catalog());
        }

        Commands::Status => {
            print_json(&runtime.registry_snapshot());
        }
    }

    Ok(())
}
