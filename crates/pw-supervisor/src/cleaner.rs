//! Periodic torrent cleanup
//!
//! Runs beside the orchestrator on its own interval. Each cycle scores every
//! torrent the client reports: an errored torrent gains a failure, a finished
//! one is marked for removal outright, and a torrent that made no progress
//! since the previous cycle gains another. Torrents reaching
//! [`REMOVAL_THRESHOLD`] are removed together with their data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pw_core::{ConfigError, PwError};
use pw_protocol::Torrent;

use crate::retry::{deadline_after, BackoffPolicy, RetryExecutor, RetryOutcome};
use crate::sync::ClientRpc;

pub const REMOVAL_THRESHOLD: u32 = 3;

/// Time budget for removing one torrent
pub const REMOVAL_BUDGET: Duration = Duration::from_secs(15);

/// Identity of a torrent across cycles
pub fn torrent_key(torrent: &Torrent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(torrent.id.to_string().as_bytes());
    hasher.update(torrent.name.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTorrent {
    pub id: i64,
    pub name: String,
    pub failures: u32,
    percent_done: f64,
    upload_ratio: f64,
}

/// Torrents seen in earlier cycles
#[derive(Debug, Default)]
pub struct CleanerState {
    seen: HashMap<String, TrackedTorrent>,
}

impl CleanerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&TrackedTorrent> {
        self.seen.get(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Score the current listing and return the keys due for removal
    ///
    /// Entries for torrents missing from the listing are dropped.
    pub fn observe(&mut self, torrents: &[Torrent]) -> Vec<String> {
        let mut next = HashMap::with_capacity(torrents.len());

        for torrent in torrents {
            let key = torrent_key(torrent);
            let mut failures = if torrent.error != 0 {
                warn!(
                    "Torrent {} ({:?}) has an error: {}",
                    torrent.id, torrent.name, torrent.error_string
                );
                1
            } else if torrent.is_finished {
                info!("Torrent {} ({:?}) finished", torrent.id, torrent.name);
                REMOVAL_THRESHOLD
            } else {
                0
            };

            if let Some(previous) = self.seen.get(&key) {
                failures += previous.failures;
                if previous.percent_done == torrent.percent_done
                    && previous.upload_ratio == torrent.upload_ratio
                {
                    failures += 1;
                }
            }

            debug!("Torrent {} ({:?}): {} failures", torrent.id, torrent.name, failures);
            next.insert(
                key,
                TrackedTorrent {
                    id: torrent.id,
                    name: torrent.name.clone(),
                    failures,
                    percent_done: torrent.percent_done,
                    upload_ratio: torrent.upload_ratio,
                },
            );
        }

        self.seen = next;
        let mut due: Vec<_> = self
            .seen
            .iter()
            .filter(|(_, t)| t.failures >= REMOVAL_THRESHOLD)
            .map(|(key, _)| key.clone())
            .collect();
        due.sort();
        due
    }

    /// Forget a torrent once it has been removed
    pub fn forget(&mut self, key: &str) -> Option<TrackedTorrent> {
        self.seen.remove(key)
    }
}

pub struct TorrentCleaner {
    client: Arc<dyn ClientRpc>,
    interval: Duration,
    removal: RetryExecutor,
    state: CleanerState,
}

impl TorrentCleaner {
    /// Fails when `interval` is zero
    pub fn new(client: Arc<dyn ClientRpc>, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cleaner.interval must be greater than zero".to_string(),
            ));
        }
        let policy = BackoffPolicy {
            max_elapsed: REMOVAL_BUDGET,
            ..BackoffPolicy::default()
        };
        Ok(Self {
            client,
            interval,
            removal: RetryExecutor::new(policy),
            state: CleanerState::new(),
        })
    }

    pub fn with_removal_retry(mut self, removal: RetryExecutor) -> Self {
        self.removal = removal;
        self
    }

    pub fn state(&self) -> &CleanerState {
        &self.state
    }

    /// Clean every `interval` until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Torrent cleaner will run every {:?}", self.interval);
        let mut ticker = interval_at(deadline_after(self.interval), self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.clean(&cancel).await {
                warn!("Torrent cleaning failed: {}", e);
            }
        }
        debug!("Torrent cleaner stopped");
    }

    /// One cleaning cycle; returns the ids removed
    pub async fn clean(&mut self, cancel: &CancellationToken) -> Result<Vec<i64>, PwError> {
        let torrents = self.client.list_torrents().await?;
        info!("Checking {} torrents", torrents.len());

        let mut removed = Vec::new();
        for key in self.state.observe(&torrents) {
            let Some(torrent) = self.state.get(&key) else {
                continue;
            };
            let (id, name) = (torrent.id, torrent.name.clone());
            info!("Removing torrent {} ({:?})", id, name);

            let client = &self.client;
            let outcome = self
                .removal
                .run(
                    cancel,
                    move || async move { client.remove_torrents(&[id], true).await },
                    |e, delay| warn!("Failed to remove torrent {} (retry in {:?}): {}", id, delay, e),
                )
                .await;

            match outcome {
                RetryOutcome::Succeeded(()) => {
                    self.state.forget(&key);
                    removed.push(id);
                }
                RetryOutcome::Cancelled => break,
                RetryOutcome::Exhausted { error, .. } => {
                    warn!("Could not remove torrent {} ({:?}), will retry next cycle: {}", id, name, error);
                }
            }
        }
        Ok(removed)
    }
}
