use anyhow::Result;
use clap::{Parser, Subcommand};
use fabricator_api::Config;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing_subscriber::prelude::*;

mod cmd_discover;
mod cmd_serve;

/// Drive a fleet of serial-attached 3D printers.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "fabricator-api")]
#[command(version = "1.0")]
struct Cli {
    /// Config file to use. Defaults apply when it doesn't exist.
    #[arg(long, short, default_value = "fabricator-api.toml")]
    config: String,

    /// Log as json lines.
    #[arg(long, env = "FABRICATOR_API_JSON_LOGS")]
    json: bool,

    /// Log filter, in `RUST_LOG` syntax.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover devices, then print queued jobs on them until interrupted.
    Serve,

    /// List the serial ports found and the model each matches.
    Discover,
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    Ok(())
}

// Spans go to an OTLP collector only when one is configured.
fn otlp_provider() -> Result<Option<SdkTracerProvider>> {
    let Ok(otlp_host) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_host)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("fabricator-api").build())
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(Some(provider))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let provider = otlp_provider()?;
    let telemetry = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("tracing-otel-subscriber")));

    let (fmt, json) = if cli.json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    // Initialize tracing.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&cli.log_level)?)
        .with(fmt)
        .with(json)
        .with(telemetry)
        .init();

    let cfg = if std::path::Path::new(&cli.config).exists() {
        Config::from_file(&cli.config.clone().into())?
    } else {
        tracing::info!(config = cli.config, "config file not found; using defaults");
        Config::default()
    };

    let result = match cli.command {
        Commands::Serve => cmd_serve::main(&cli, &cfg).await,
        Commands::Discover => cmd_discover::main(&cli, &cfg).await,
    };

    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = format!("{:?}", e), "failed to flush spans");
        }
    }
    result
}
