//! Boots a runtime from a root folder and serves until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use spaceport_server::{HostServices, Runtime, RuntimeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "spaceport", version, about = "Multi-tenant api hosting runtime")]
struct Args {
    /// Root folder; spaces are loaded from `<root>/spaces`.
    #[arg(long, env = "SPACEPORT_ROOT", default_value = ".")]
    root: PathBuf,

    /// Folder of api archives installable by name.
    #[arg(long, env = "SPACEPORT_EXTERNAL_SPACES")]
    external_spaces: Option<PathBuf>,

    /// Seconds between status flushes.
    #[arg(long, env = "SPACEPORT_FLUSH_INTERVAL", default_value_t = 20)]
    flush_interval: u64,

    /// Keep lifecycle status in memory only.
    #[arg(long)]
    read_only_status: bool,

    /// Default message language.
    #[arg(long, default_value = "en")]
    language: String,

    #[arg(long, value_enum, env = "SPACEPORT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await?;

    tracing::info!("shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = RuntimeConfig::new(&args.root);
    config.external_spaces = args.external_spaces;
    config.status.flush_interval = Duration::from_secs(args.flush_interval.max(1));
    config.status.read_only = args.read_only_status;
    config.default_language = args.language;

    let runtime = Runtime::boot(config, HostServices::default()).await?;
    tracing::info!(
        root = %args.root.display(),
        spaces = runtime.spaces().len(),
        "spaceport ready"
    );

    shutdown_signal().await?;
    runtime.shutdown().await;
    Ok(())
}
