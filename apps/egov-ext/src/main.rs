//! egov-ext - identity-governance reconciliation extension
//!
//! Invoked by a deployment orchestrator once per declared resource:
//! - reads one request envelope from a file or stdin
//! - runs `preview` or `create-or-update` for the named resource type
//! - writes the response envelope (or an error envelope) to stdout
//!
//! Logs go to stderr so stdout carries nothing but the envelope.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use egov_reconcile::{Engine, EngineConfig, HandlerRegistry, Operation};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod error;

use error::{ExtError, ExtResult};

/// Identity-governance reconciliation extension
#[derive(Parser)]
#[command(name = "egov-ext")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the live state of a resource without writing anything
    Preview(OperationArgs),

    /// Create the resource if absent, update drifted fields if present
    CreateOrUpdate(OperationArgs),

    /// List the supported resource types
    Types,
}

#[derive(Args)]
struct OperationArgs {
    /// Resource type, e.g. Catalog or GroupPimEligibility
    #[arg(long = "type", short = 't')]
    resource_type: String,

    /// Request envelope file; reads stdin when omitted or `-`
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,egov_reconcile=debug")),
        )
        .init();

    let cli = Cli::parse();
    let (operation, args) = match cli.command {
        Commands::Preview(args) => (Operation::Preview, args),
        Commands::CreateOrUpdate(args) => (Operation::CreateOrUpdate, args),
        Commands::Types => {
            for resource_type in HandlerRegistry::with_defaults().resource_types() {
                println!("{resource_type}");
            }
            return ExitCode::SUCCESS;
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight requests");
            on_interrupt.cancel();
        }
    });

    match run(operation, &args, cancel).await {
        Ok(response) => {
            println!("{response}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "Operation failed");
            println!("{}", e.envelope());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(
    operation: Operation,
    args: &OperationArgs,
    cancel: CancellationToken,
) -> ExtResult<Value> {
    let engine = Engine::new(EngineConfig::from_env()?)?;
    let envelope: Value = serde_json::from_str(&read_envelope(args.input.as_ref()).await?)?;

    tracing::info!(
        resource_type = %args.resource_type,
        operation = %operation,
        "Running operation"
    );
    let response = HandlerRegistry::with_defaults()
        .dispatch(&engine, &args.resource_type, operation, envelope, cancel)
        .await?;
    Ok(response)
}

async fn read_envelope(input: Option<&PathBuf>) -> Result<String, ExtError> {
    match input {
        Some(path) if path.as_os_str() != "-" => Ok(tokio::fs::read_to_string(path).await?),
        _ => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}
