//! Read-only copy of the primary's settings held by a secondary.
//!
//! Broadcasts carry the full mapping plus a version. The cache only accepts
//! the exact successor of what it holds; anything further ahead means a
//! message went missing and the caller must ask for a full resync.

use coord_common::SharedSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    Applied { version: u64 },
    /// Older than or equal to what we hold; ignored.
    Stale { have: u64, got: u64 },
    /// Not the direct successor. `resync` is true when the caller should
    /// send `RequestGlobalSettings` (false if one is already outstanding).
    Gap { have: u64, got: u64, resync: bool },
}

#[derive(Debug, Default)]
pub struct SettingsCache {
    current: SharedSettings,
    synced: bool,
    resync_pending: bool,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &SharedSettings {
        &self.current
    }

    /// `None` until the first snapshot has been applied.
    pub fn version(&self) -> Option<u64> {
        self.synced.then_some(self.current.version)
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    /// Snapshots answer a registration or a resync request and replace the
    /// cache wholesale; unsolicited ones follow the broadcast rule.
    pub fn apply_snapshot(&mut self, snapshot: SharedSettings) -> CacheUpdate {
        if !self.synced || self.resync_pending {
            if self.synced && snapshot.version < self.current.version {
                return CacheUpdate::Stale {
                    have: self.current.version,
                    got: snapshot.version,
                };
            }
            let version = snapshot.version;
            self.current = snapshot;
            self.synced = true;
            self.resync_pending = false;
            return CacheUpdate::Applied { version };
        }
        self.apply_successor(snapshot)
    }

    pub fn apply_broadcast(&mut self, broadcast: SharedSettings) -> CacheUpdate {
        if !self.synced {
            let resync = !self.resync_pending;
            self.resync_pending = true;
            return CacheUpdate::Gap {
                have: 0,
                got: broadcast.version,
                resync,
            };
        }
        self.apply_successor(broadcast)
    }

    fn apply_successor(&mut self, next: SharedSettings) -> CacheUpdate {
        let have = self.current.version;
        let got = next.version;

        if got <= have {
            return CacheUpdate::Stale { have, got };
        }
        if got == have + 1 {
            self.current = next;
            return CacheUpdate::Applied { version: got };
        }

        let resync = !self.resync_pending;
        self.resync_pending = true;
        CacheUpdate::Gap { have, got, resync }
    }
}
