use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Active { holders: usize },
    Cooling { generation: u64, until: Instant },
}

/// Registry of lower-cased remote paths that one pipeline is currently
/// writing, so the opposite pipeline ignores the echo of that write.
///
/// A path stays tracked while any holder is active and for `grace` after the
/// last holder stops. Each cool-down carries a generation; a removal timer only
/// clears the record it was scheduled for.
#[derive(Clone)]
pub struct OperationTracker {
    paths: Arc<DashMap<String, TrackState>>,
    generations: Arc<AtomicU64>,
    grace: Duration,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl OperationTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            paths: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
            grace,
        }
    }

    pub fn start(&self, key: &str) {
        self.paths
            .entry(key.to_string())
            .and_modify(|state| {
                *state = match *state {
                    TrackState::Active { holders } => TrackState::Active {
                        holders: holders + 1,
                    },
                    TrackState::Cooling { .. } => TrackState::Active { holders: 1 },
                }
            })
            .or_insert(TrackState::Active { holders: 1 });
    }

    pub fn stop(&self, key: &str) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let until = Instant::now() + self.grace;
        let mut cooling = false;
        if let Some(mut state) = self.paths.get_mut(key) {
            match *state {
                TrackState::Active { holders } if holders > 1 => {
                    *state = TrackState::Active {
                        holders: holders - 1,
                    };
                }
                TrackState::Active { .. } => {
                    *state = TrackState::Cooling { generation, until };
                    cooling = true;
                }
                TrackState::Cooling { .. } => {}
            }
        }
        if cooling {
            self.schedule_removal(key.to_string(), generation, until);
        }
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        match self.paths.get(key).map(|state| *state) {
            None => false,
            Some(TrackState::Active { .. }) => true,
            Some(TrackState::Cooling { until, .. }) => Instant::now() < until,
        }
    }

    /// Starts tracking `key` until the returned guard is dropped.
    pub fn track(&self, key: impl Into<String>) -> TrackGuard {
        let key = key.into();
        self.start(&key);
        TrackGuard {
            tracker: self.clone(),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn schedule_removal(&self, key: String, generation: u64, until: Instant) {
        // Without a runtime the expired record is still ignored by
        // `is_tracked`; it is replaced on the next start.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let paths = Arc::clone(&self.paths);
        handle.spawn(async move {
            tokio::time::sleep_until(until).await;
            let removed = paths.remove_if(&key, |_, state| {
                matches!(state, TrackState::Cooling { generation: current, .. } if *current == generation)
            });
            if removed.is_some() {
                debug!(path = %key, "tracking released");
            }
        });
    }
}

pub struct TrackGuard {
    tracker: OperationTracker,
    key: String,
}

impl TrackGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.tracker.stop(&self.key);
    }
}
