// Service controller: serve the HTTP surface or rotate signing keys.
//
// Exit codes: 0 ok, 2 configuration error, 3 runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sabt::{AppConfig, Application, JsonLogLayer};
use sabt_clock::SystemClock;
use sabt_metrics::ServiceMetrics;
use sabt_signing::rotation;

#[derive(Parser)]
#[command(name = "sabt", about = "Sabt allocation and export service", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        /// Bind address
        #[arg(long, env = "SABT_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Rotate download signing keys (offline admin operation)
    RotateKeys {
        #[command(subcommand)]
        operation: RotateOperation,
    },
}

#[derive(Subcommand)]
enum RotateOperation {
    /// Mint a fresh `next` key
    Generate {
        /// Key set file; falls back to auth.signing_keys_file
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Explicit key id; random when omitted
        #[arg(long)]
        kid: Option<String>,
    },
    /// Promote the `next` key to active
    Promote {
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
}

const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let clock = Arc::new(SystemClock::for_timezone(&config.timezone)?);
    let filter = if config.enable_debug_logs {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(JsonLogLayer::new(config.service_name.clone(), clock))
        .init();
    Ok(())
}

fn resolve_key_file(config: &AppConfig, key_file: Option<PathBuf>) -> Option<PathBuf> {
    key_file.or_else(|| config.auth.signing_keys_file.as_ref().map(PathBuf::from))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(error) = init_logging(&config) {
        eprintln!("{error}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match cli.command {
        Command::Serve { bind } => {
            let application = match Application::builder(config).build().await {
                Ok(application) => application,
                Err(error) => {
                    tracing::error!(error = %error, "application assembly failed");
                    return ExitCode::from(EXIT_RUNTIME);
                }
            };
            if let Err(error) = application.serve(&bind).await {
                tracing::error!(error = %error, "server failed");
                return ExitCode::from(EXIT_RUNTIME);
            }
            ExitCode::SUCCESS
        }
        Command::RotateKeys { operation } => {
            let metrics = match ServiceMetrics::new(&config.metrics_namespace) {
                Ok(metrics) => metrics,
                Err(error) => {
                    tracing::error!(error = %error, "metrics construction failed");
                    return ExitCode::from(EXIT_RUNTIME);
                }
            };
            let (key_file, result) = match operation {
                RotateOperation::Generate { key_file, kid } => {
                    let Some(key_file) = resolve_key_file(&config, key_file) else {
                        tracing::error!("no signing key file configured");
                        return ExitCode::from(EXIT_CONFIG);
                    };
                    let result = rotation::generate(&key_file, kid, &metrics);
                    (key_file, result)
                }
                RotateOperation::Promote { key_file } => {
                    let Some(key_file) = resolve_key_file(&config, key_file) else {
                        tracing::error!("no signing key file configured");
                        return ExitCode::from(EXIT_CONFIG);
                    };
                    let result = rotation::promote(&key_file, &metrics);
                    (key_file, result)
                }
            };
            match result {
                Ok(keys) => {
                    let active = keys
                        .active()
                        .map(|key| key.kid.clone())
                        .unwrap_or_default();
                    let next = keys.next().map(|key| key.kid.clone());
                    tracing::info!(
                        key_file = %key_file.display(),
                        active_kid = %active,
                        next_kid = ?next,
                        "signing keys rotated"
                    );
                    ExitCode::SUCCESS
                }
                Err(error) => {
                    tracing::error!(error = %error, "rotation failed");
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }
    }
}
