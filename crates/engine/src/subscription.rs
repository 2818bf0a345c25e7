//! Snapshot-then-stream subscriptions.
//!
//! A subscriber registers with the store first and reads the current
//! snapshots second. Anything published in between shows up in both places;
//! the [`VersionGate`] drops the live copies that the initial read already
//! covered.

use std::sync::Arc;

use lookout_core::{LookoutError, ResourceChange, ResourceSnapshot, Version};
use lookout_store::Registration;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-subscriber duplicate filter keyed by resource name.
#[derive(Debug, Default)]
pub struct VersionGate {
    seen: FxHashMap<String, Version>,
}

impl VersionGate {
    pub fn record(initial: &[Arc<ResourceSnapshot>]) -> Self {
        Self { seen: initial.iter().map(|s| (s.name.clone(), s.version)).collect() }
    }

    /// Whether `change` is new to this subscriber.
    ///
    /// Changes at or below the version delivered in the initial data are
    /// dropped. The entry is forgotten at the first change that reaches the
    /// recorded version: per-resource order is total, so nothing older can
    /// follow it.
    pub fn admit(&mut self, change: &ResourceChange) -> bool {
        let Some(&seen) = self.seen.get(change.name()) else {
            return true;
        };
        let version = change.version();
        if version >= seen {
            self.seen.remove(change.name());
        }
        version > seen
    }

    /// Entries still waiting for their first live change.
    pub fn pending(&self) -> usize {
        self.seen.len()
    }
}

/// Live half of a subscription.
pub struct ChangeFeed {
    registration: Registration,
    gate: VersionGate,
    cancel: CancellationToken,
    done: bool,
}

impl ChangeFeed {
    pub(crate) fn new(registration: Registration, gate: VersionGate, cancel: CancellationToken) -> Self {
        Self { registration, gate, cancel, done: false }
    }

    /// Next change for this subscriber.
    ///
    /// Returns `None` when the subscription is cancelled or the engine stops.
    /// An `Err` is terminal: the feed ends right after it. Cancel safe.
    pub async fn next(&mut self) -> Option<Result<ResourceChange, LookoutError>> {
        if self.done {
            return None;
        }
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                n = self.registration.recv() => n,
            };
            match item {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Ok(change)) => {
                    if self.gate.admit(&change) {
                        return Some(Ok(change));
                    }
                    trace!(name = %change.name(), version = change.version(), "change already in initial data; skipped");
                }
            }
        }
    }

    /// Stop this feed. Other subscribers are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Changes queued for this subscriber and not yet consumed.
    pub fn backlog(&self) -> usize {
        self.registration.backlog()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("registration", &self.registration)
            .field("pending", &self.gate.pending())
            .field("done", &self.done)
            .finish()
    }
}

/// Result of [`NotificationEngine::subscribe`](crate::NotificationEngine::subscribe).
#[derive(Debug)]
pub struct Subscription {
    /// Every live resource at subscribe time, ordered by name.
    pub initial: Vec<Arc<ResourceSnapshot>>,
    pub changes: ChangeFeed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(name: &str, version: Version) -> ResourceChange {
        let mut s = ResourceSnapshot::new(name);
        s.version = version;
        ResourceChange::Upsert(Arc::new(s))
    }

    fn gate(entries: &[(&str, Version)]) -> VersionGate {
        let initial: Vec<_> = entries
            .iter()
            .map(|(n, v)| {
                let mut s = ResourceSnapshot::new(*n);
                s.version = *v;
                Arc::new(s)
            })
            .collect();
        VersionGate::record(&initial)
    }

    #[test]
    fn unknown_resources_pass() {
        let mut g = gate(&[]);
        assert!(g.admit(&up("x", 1)));
    }

    #[test]
    fn stale_and_equal_versions_are_dropped() {
        let mut g = gate(&[("r", 3)]);
        assert!(!g.admit(&up("r", 2)));
        assert_eq!(g.pending(), 1, "an older change does not consume the entry");
        assert!(!g.admit(&up("r", 3)));
        assert_eq!(g.pending(), 0);
        assert!(g.admit(&up("r", 4)));
    }

    #[test]
    fn newer_version_passes_and_clears_entry() {
        let mut g = gate(&[("r", 3)]);
        assert!(g.admit(&up("r", 5)));
        assert_eq!(g.pending(), 0);
        assert!(g.admit(&up("r", 6)));
    }

    #[test]
    fn stale_delete_is_dropped() {
        let mut g = gate(&[("r", 5)]);
        assert!(!g.admit(&ResourceChange::Delete { name: "r".into(), version: 4 }));
        assert!(g.admit(&ResourceChange::Delete { name: "r".into(), version: 6 }));
    }
}
