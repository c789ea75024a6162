//! Rotten-window detection.
//!
//! Every window stamps its id into a shared record on each heartbeat. A
//! window whose stamp is missing or older than `rotten_after` is rotten.
//!
//! The record carries an epoch. Base-main starts a fresh epoch when it opens;
//! writers remember the epoch they opened with and stop writing once it
//! changes, so windows left over from an earlier session can't revive
//! themselves. Every write compares the epoch and replaces the record in one
//! store update.

use crate::clock::Clock;
use crate::store::{Storage, StoreError, LIVENESS_KEY};
use paneweave_ipc::BASE_MAIN_ID;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Grace period past the next expected heartbeat.
pub const DEFAULT_ROTTEN_THRESHOLD: Duration = Duration::from_millis(1000);

/// Persisted heartbeat stamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub epoch: u64,
    #[serde(default)]
    pub windows: BTreeMap<String, u64>,
}

/// Heartbeat registry of one window.
#[derive(Clone)]
pub struct LivenessRegistry {
    storage: Storage,
    clock: Arc<dyn Clock>,
    epoch: u64,
    rotten_after: Duration,
}

impl LivenessRegistry {
    /// Open the registry.
    ///
    /// Base-main resets the record to a fresh epoch holding only its own
    /// stamp. Other windows adopt the stored epoch, or start one if there is
    /// no record yet.
    pub fn open(
        storage: Storage,
        clock: Arc<dyn Clock>,
        own_id: &str,
        is_base_main: bool,
        rotten_after: Duration,
    ) -> Result<Self, StoreError> {
        let now = clock.now_ms();
        let mut epoch = now;

        let reset = storage.update(LIVENESS_KEY, None, |stored: Option<LivenessRecord>| {
            epoch = match (&stored, is_base_main) {
                (Some(record), false) => record.epoch,
                (Some(record), true) => now.max(record.epoch + 1),
                (None, _) => now,
            };
            if stored.is_some() && !is_base_main {
                return None;
            }
            let mut windows = BTreeMap::new();
            if is_base_main {
                windows.insert(own_id.to_string(), now);
            }
            Some(LivenessRecord { epoch, windows })
        })?;
        if reset {
            debug!("Liveness record reset to epoch {}", epoch);
        }

        Ok(Self {
            storage,
            clock,
            epoch,
            rotten_after,
        })
    }

    /// Erase a window's stamp without opening a registry.
    pub fn erase(storage: &Storage, id: &str) -> Result<(), StoreError> {
        storage.update(LIVENESS_KEY, None, |stored: Option<LivenessRecord>| {
            let mut record = stored?;
            record.windows.remove(id)?;
            Some(record)
        })?;
        Ok(())
    }

    /// Epoch this registry writes under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Threshold after which a stamp is stale.
    pub fn rotten_after(&self) -> Duration {
        self.rotten_after
    }

    /// Stamp a window as alive now. Returns whether the stamp was written.
    pub fn register(&self, id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut stored_epoch = None;

        let written = self
            .storage
            .update(LIVENESS_KEY, None, |stored: Option<LivenessRecord>| {
                let mut record = stored?;
                stored_epoch = Some(record.epoch);
                if record.epoch != self.epoch {
                    return None;
                }
                record.windows.insert(id.to_string(), now);
                Some(record)
            })?;

        if !written {
            match stored_epoch {
                Some(epoch) => debug!(
                    "Not registering {}: epoch moved from {} to {}",
                    id, self.epoch, epoch
                ),
                None => debug!("Not registering {}: liveness record is gone", id),
            }
        }
        Ok(written)
    }

    /// Erase a window's stamp.
    pub fn renew(&self, id: &str) -> Result<(), StoreError> {
        Self::erase(&self.storage, id)
    }

    /// Last heartbeat of a window.
    pub fn last_seen(&self, id: &str) -> Option<u64> {
        self.record().and_then(|r| r.windows.get(id).copied())
    }

    /// Whether a window missed its heartbeats or was never seen.
    pub fn is_rotten(&self, id: &str) -> bool {
        match self.last_seen(id) {
            Some(seen) => {
                let threshold = self.rotten_after.as_millis() as u64;
                self.clock.now_ms().saturating_sub(seen) > threshold
            }
            None => true,
        }
    }

    /// Whether base-main is rotten.
    pub fn is_main_rotten(&self) -> bool {
        self.is_rotten(BASE_MAIN_ID)
    }

    /// Current stored record.
    pub fn record(&self) -> Option<LivenessRecord> {
        match read_record(&self.storage) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to read liveness record: {}", e);
                None
            }
        }
    }
}

fn read_record(storage: &Storage) -> Result<Option<LivenessRecord>, StoreError> {
    storage.get::<LivenessRecord>(LIVENESS_KEY, None)
}
