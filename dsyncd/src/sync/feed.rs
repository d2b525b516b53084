use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::engine::SyncError;
use super::entry::RemoteEntry;
use super::remote::RemoteStore;
use super::store::MetadataStore;

/// Receives each page of remote changes after its cursor is persisted.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn accept(&self, entries: Vec<RemoteEntry>) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Continuing,
    LongPolling,
}

/// Cursor-driven change loop: pages through `list_changes` while the remote
/// reports more, then long-polls until something changes.
pub struct RemoteChangeFeed {
    remote: Arc<dyn RemoteStore>,
    store: Arc<MetadataStore>,
    sink: Arc<dyn ChangeSink>,
    cursor: String,
    state: FeedState,
    backoff: Backoff,
}

impl RemoteChangeFeed {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<MetadataStore>,
        sink: Arc<dyn ChangeSink>,
        cursor: String,
    ) -> Self {
        Self {
            remote,
            store,
            sink,
            cursor,
            state: FeedState::Continuing,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60), true),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Runs until a pagination or persistence error; long-poll failures are
    /// retried indefinitely.
    pub async fn run(mut self) -> Result<(), SyncError> {
        info!("remote change feed started");
        loop {
            self.step().await?;
        }
    }

    pub async fn step(&mut self) -> Result<(), SyncError> {
        match self.state {
            FeedState::Continuing => {
                let page = self.remote.list_changes(&self.cursor).await?;
                self.store.set_cursor(&page.cursor).await?;
                self.cursor = page.cursor;
                if !page.entries.is_empty() {
                    info!(count = page.entries.len(), "remote changes received");
                }
                self.sink.accept(page.entries).await?;
                if !page.has_more {
                    self.state = FeedState::LongPolling;
                }
            }
            FeedState::LongPolling => match self.remote.long_poll(&self.cursor).await {
                Ok(outcome) => {
                    self.backoff.reset();
                    if outcome.changed {
                        debug!("long poll reported changes");
                        self.state = FeedState::Continuing;
                    }
                    if let Some(wait) = outcome.backoff {
                        debug!(seconds = wait.as_secs(), "remote asked to back off");
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        attempt = self.backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "long poll failed: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "feed_tests.rs"]
mod tests;
