use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use dsyncd::daemon::{DaemonConfig, DaemonRuntime};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Keeps a local folder and a Dropbox account in sync.
#[derive(Debug, Parser)]
#[command(name = "dsyncd", version)]
struct Cli {
    /// Metadata database file
    #[arg(long, env = "DSYNC_DB")]
    db: Option<PathBuf>,

    /// Local folder to keep in sync
    #[arg(long, env = "DSYNC_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Delete the metadata database (cursor, saved token, local folder) before starting
    #[arg(long)]
    reset: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

async fn reset_database(db_path: &Path) -> anyhow::Result<()> {
    let mut sidecars = Vec::new();
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        sidecars.push(PathBuf::from(name));
    }
    for path in std::iter::once(db_path.to_path_buf()).chain(sidecars) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = ?path, "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("failed to remove {path:?}")),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    let config = DaemonConfig::from_env(cli.db, cli.local_dir)?;
    if cli.reset {
        reset_database(&config.db_path).await?;
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
