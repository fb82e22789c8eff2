//! # Version Tracker
//!
//! Owns the native side of every frozen snapshot a session publishes and
//! closes each one once no [`VersionedHandle`] references it any more.
//!
//! ```text
//! publish(v7) ──► track_and_reclaim(v7)
//!                   ├── add (snapshot#12, handle 31)
//!                   └── sweep:
//!                         (snapshot#9,  handle 20)  alive  → keep
//!                         (snapshot#10, handle 24)  gone   → engine.close()
//!                         (snapshot#11, handle 27)  gone   → engine.close()
//! ```
//!
//! Reachability is read from the session's [`HandleRegistry`], so the sweep
//! is deterministic: a pointer is closed on the first publish after its last
//! handle clone was dropped.
//!
//! ## Thread Safety
//!
//! Methods take `&mut self`. The session keeps the tracker behind the same
//! lock that guards its current-version slot, so publication and reclaim are
//! never interleaved.

use tracing::{debug, warn};

use crate::engine::{EngineErrorKind, NativeEngine, SnapshotPtr};
use crate::handle::{HandleId, HandleRegistry, VersionedHandle};
use crate::types::VersionId;

#[derive(Debug, Clone, Copy)]
struct TrackedVersion {
    snapshot: SnapshotPtr,
    handle: HandleId,
    version: VersionId,
}

/// Reclaims frozen snapshots that are no longer referenced.
#[derive(Debug, Default)]
pub struct VersionTracker {
    tracked: Vec<TrackedVersion>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `handle` and closes every tracked snapshot whose handle is gone.
    ///
    /// Live handles are not tracked; their owner closes them. Returns the
    /// number of snapshots reclaimed.
    pub fn track_and_reclaim(
        &mut self,
        engine: &dyn NativeEngine,
        registry: &HandleRegistry,
        handle: &VersionedHandle,
    ) -> usize {
        if handle.is_frozen() && !self.tracked.iter().any(|t| t.handle == handle.id()) {
            if let Ok(version) = handle.version() {
                self.tracked.push(TrackedVersion {
                    snapshot: handle.snapshot(),
                    handle: handle.id(),
                    version,
                });
            }
        }

        let mut reclaimed = 0;
        self.tracked.retain(|entry| {
            if registry.is_alive(entry.handle) {
                return true;
            }
            close_snapshot(engine, entry.snapshot);
            reclaimed += 1;
            false
        });
        if reclaimed > 0 {
            debug!(reclaimed, tracked = self.tracked.len(), "reclaimed frozen versions");
        }
        reclaimed
    }

    /// Releases every tracked snapshot unconditionally.
    pub fn close(&mut self, engine: &dyn NativeEngine) -> usize {
        let count = self.tracked.len();
        for entry in self.tracked.drain(..) {
            close_snapshot(engine, entry.snapshot);
        }
        count
    }

    /// Number of snapshots currently tracked.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Versions of the tracked snapshots, oldest first.
    pub fn versions(&self) -> Vec<VersionId> {
        let mut versions: Vec<VersionId> = self.tracked.iter().map(|t| t.version).collect();
        versions.sort();
        versions
    }
}

/// Closes `snapshot`, logging failures instead of returning them.
pub(crate) fn close_snapshot(engine: &dyn NativeEngine, snapshot: SnapshotPtr) {
    match engine.close(snapshot) {
        Ok(()) => {}
        // double release
        Err(err) if err.kind == EngineErrorKind::Closed => {
            warn!(snapshot = %snapshot, "snapshot already closed");
        }
        Err(err) => {
            warn!(snapshot = %snapshot, error = %err, "failed to close snapshot");
        }
    }
}
