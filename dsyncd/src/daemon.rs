use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dsync_core::{DropboxClient, OAuthClient};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sync::download::DownloadPipeline;
use crate::sync::engine::EngineConfig;
use crate::sync::feed::RemoteChangeFeed;
use crate::sync::remote::RemoteStore;
use crate::sync::store::{MetadataStore, default_db_path};
use crate::sync::tracker::{DEFAULT_GRACE, OperationTracker};
use crate::sync::upload::UploadPipeline;
use crate::sync::watcher::{LocalChangeWatcher, WatcherConfig};

const DEFAULT_SYNC_DIR_NAME: &str = "Dropbox";
const ACCESS_TOKEN_KEY: &str = "access_token";
const LOCAL_DIR_KEY: &str = "local_dir";

/// Everything the daemon needs before it touches the network.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub local_dir: Option<PathBuf>,
    pub credentials: Credentials,
    pub api_base_url: Option<String>,
    pub tracker_grace: Duration,
    pub engine: EngineConfig,
    pub watcher: WatcherConfig,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("app_key", &self.app_key)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DaemonConfig {
    pub fn from_env(db_path: Option<PathBuf>, local_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path().context("cannot locate a data directory for the database")?,
        };
        let home = dirs::home_dir();
        let local_dir = local_dir.map(|dir| match &home {
            Some(home) => expand_with_home(&dir.to_string_lossy(), home),
            None => dir,
        });

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            quick_workers: read_usize_env("DSYNC_QUICK_WORKERS", defaults.quick_workers),
            slow_workers: read_usize_env("DSYNC_SLOW_WORKERS", defaults.slow_workers),
            slow_threshold: read_u64_env("DSYNC_SLOW_THRESHOLD_BYTES", defaults.slow_threshold),
        };
        let watcher_defaults = WatcherConfig::default();
        let watcher = WatcherConfig {
            sweep_interval: Duration::from_millis(read_u64_env(
                "DSYNC_SWEEP_INTERVAL_MS",
                watcher_defaults.sweep_interval.as_millis() as u64,
            )),
            ..watcher_defaults
        };

        Ok(Self {
            db_path,
            local_dir,
            credentials: Credentials {
                access_token: read_string_env("DSYNC_ACCESS_TOKEN"),
                app_key: read_string_env("DSYNC_APP_KEY"),
                app_secret: read_string_env("DSYNC_APP_SECRET"),
            },
            api_base_url: read_string_env("DSYNC_API_BASE_URL"),
            tracker_grace: Duration::from_millis(read_u64_env(
                "DSYNC_TRACKER_GRACE_MS",
                DEFAULT_GRACE.as_millis() as u64,
            )),
            engine,
            watcher,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: Arc<MetadataStore>,
    client: Arc<DropboxClient>,
    local_dir: PathBuf,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = MetadataStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open metadata store at {:?}", config.db_path))?;
        let store = Arc::new(store);

        let token = resolve_access_token(&store, &config.credentials, config.api_base_url.as_deref())
            .await?;
        let client = Arc::new(build_client(config.api_base_url.as_deref(), &token)?);

        let local_dir = resolve_local_dir(&store, config.local_dir.clone()).await?;
        tokio::fs::create_dir_all(&local_dir)
            .await
            .with_context(|| format!("failed to create local folder at {local_dir:?}"))?;
        let local_dir = tokio::fs::canonicalize(&local_dir)
            .await
            .with_context(|| format!("failed to resolve local folder {local_dir:?}"))?;

        greet(&client).await?;

        Ok(Self {
            config,
            store,
            client,
            local_dir,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let remote: Arc<dyn RemoteStore> = self.client.clone();
        let cursor = match self.store.cursor().await? {
            Some(cursor) => cursor,
            None => initial_sync(remote.as_ref(), &self.store)
                .await
                .context("initial sync failed")?,
        };

        let tracker = OperationTracker::new(self.config.tracker_grace);
        let downloads = DownloadPipeline::new(
            remote.clone(),
            self.store.clone(),
            tracker.clone(),
            self.local_dir.clone(),
            self.config.engine,
        );
        let uploads = UploadPipeline::new(
            remote.clone(),
            self.store.clone(),
            tracker.clone(),
            self.local_dir.clone(),
            self.config.engine,
        );

        let mut handles: Vec<JoinHandle<()>> = downloads.start();
        handles.extend(uploads.start());
        let watcher = LocalChangeWatcher::start(
            self.local_dir.clone(),
            tracker,
            Arc::new(uploads),
            self.config.watcher,
        )
        .context("failed to start local watcher")?;

        downloads.download_all_unmaterialized().await?;

        let feed = RemoteChangeFeed::new(remote, self.store.clone(), Arc::new(downloads), cursor);
        let mut feed_handle = tokio::spawn(feed.run());
        info!(local_dir = ?self.local_dir, "dsync is running, press Ctrl-C to stop");

        let outcome = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")
                    .map(|()| info!("shutdown requested"))
            }
            res = &mut feed_handle => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("remote change feed stopped: {err}");
                    Err(anyhow::Error::new(err).context("remote change feed stopped"))
                }
                Err(err) => Err(anyhow::Error::new(err).context("remote change feed panicked")),
            },
        };

        feed_handle.abort();
        for handle in handles {
            handle.abort();
        }
        drop(watcher);
        outcome
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
