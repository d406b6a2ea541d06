//! Trigger Relay
//!
//! AWS Lambda function that forwards a Step Functions trigger into a GCP
//! Pub/Sub topic. Identity is verified with STS first; the Pub/Sub client
//! authenticates through Workload Identity Federation. Zero static keys.
//!
//! # Usage
//! ```bash
//! # Run under the Lambda runtime (default)
//! trigger-relay
//!
//! # Relay one trigger locally and print the response
//! trigger-relay --log-format text invoke --workflow-id wf-1 --execution-id ex-1
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lambda_runtime::{service_fn, LambdaEvent};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trigger_relay::{
    GcpPubSubConnector, InboundEvent, InvocationContext, RelayResponse, StsIdentityVerifier,
    TriggerRelay,
};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "trigger-relay")]
#[command(about = "Cross-cloud trigger relay: Step Functions to Pub/Sub", long_about = None)]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    /// Structured JSON lines (CloudWatch)
    Json,
    /// Human-readable text
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve invocations from the Lambda runtime API (default)
    Serve,

    /// Relay a single trigger and print the response as JSON
    Invoke {
        /// Workflow identifier
        #[arg(long)]
        workflow_id: String,

        /// Execution identifier
        #[arg(long)]
        execution_id: String,

        /// Upstream trigger time to carry through
        #[arg(long)]
        trigger_time: Option<String>,
    },
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_format);

    let relay = Arc::new(TriggerRelay::new(
        StsIdentityVerifier::new(),
        GcpPubSubConnector::new(),
    ));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(relay).await,
        Commands::Invoke {
            workflow_id,
            execution_id,
            trigger_time,
        } => {
            let event = InboundEvent {
                workflow_id,
                execution_id,
                trigger_time,
            };
            let response = relay
                .invoke_from_env(event, InvocationContext::local())
                .await
                .into_response();

            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("Failed to serialize response")?
            );

            if !response.success {
                anyhow::bail!(
                    "Relay failed: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(())
        }
    }
}

async fn serve(relay: Arc<TriggerRelay<StsIdentityVerifier, GcpPubSubConnector>>) -> Result<()> {
    info!("Trigger relay waiting for invocations");

    lambda_runtime::run(service_fn(move |event: LambdaEvent<InboundEvent>| {
        let relay = relay.clone();
        async move {
            let ctx = InvocationContext::from(&event.context);
            let response = relay.invoke_from_env(event.payload, ctx).await.into_response();
            Ok::<RelayResponse, lambda_runtime::Error>(response)
        }
    }))
    .await
    .map_err(|e| anyhow::anyhow!("Lambda runtime failed: {}", e))
}

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}
