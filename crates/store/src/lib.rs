//! Lookout store: versioned per-resource snapshots and change fan-out.
//!
//! Each resource owns a slot with its own version counter and lock. Updates
//! to one resource serialize on that lock; updates to different resources
//! never contend. Readers load snapshots without taking slot locks.
//!
//! Deleted resources leave a tombstone so a re-created name keeps counting
//! from where it stopped. Tombstones are bounded: once more than
//! `max_tombstones` pile up they are all pruned, and the highest version they
//! held becomes the starting point for any slot created afterwards. Memory is
//! therefore one slot per live resource plus at most `max_tombstones`, and
//! versions of a name never go backwards.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use lookout_core::{LookoutError, ResourceChange, ResourceSnapshot, ResourceType, Version};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Item delivered to a registered watcher.
pub type Notification = Result<ResourceChange, LookoutError>;

/// Default backlog at which a watcher queue is reported as slow.
pub const DEFAULT_BACKLOG_WARN: usize = 4096;

/// Default number of tombstones kept before pruning.
pub const DEFAULT_MAX_TOMBSTONES: usize = 4096;

struct SlotState {
    /// Last version handed out.
    last_version: Version,
    /// Deleted and not re-created yet.
    tombstone: bool,
    /// Pruned from the map; writers holding a stale handle must look again.
    retired: bool,
}

struct Slot {
    /// Holding this lock is the per-resource critical section.
    state: Mutex<SlotState>,
    /// `None` while the resource is deleted.
    current: ArcSwapOption<ResourceSnapshot>,
}

impl Slot {
    fn new(start: Version) -> Self {
        Self {
            state: Mutex::new(SlotState { last_version: start, tombstone: false, retired: false }),
            current: ArcSwapOption::empty(),
        }
    }
}

/// Latest snapshot of every known resource.
pub struct VersionedStore {
    slots: DashMap<String, Arc<Slot>>,
    fanout: Arc<Fanout>,
    live: AtomicUsize,
    tombstones: AtomicUsize,
    max_tombstones: usize,
    /// Highest version held by any pruned slot.
    floor: AtomicU64,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::with_backlog_warn(DEFAULT_BACKLOG_WARN)
    }
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog_warn(backlog_warn: usize) -> Self {
        Self {
            slots: DashMap::new(),
            fanout: Arc::new(Fanout::new(backlog_warn)),
            live: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            max_tombstones: DEFAULT_MAX_TOMBSTONES,
            floor: AtomicU64::new(0),
        }
    }

    pub fn with_max_tombstones(mut self, max_tombstones: usize) -> Self {
        self.max_tombstones = max_tombstones;
        self
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(name) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Slot::new(self.floor.load(Ordering::Acquire))))
                .value(),
        )
    }

    /// Apply `mutator` to the current snapshot of `name` (or to an empty
    /// placeholder of `default_type`), assign the next version and publish
    /// the result to every watcher.
    pub fn update<F>(&self, name: &str, default_type: &ResourceType, mutator: F) -> Arc<ResourceSnapshot>
    where
        F: FnOnce(&ResourceSnapshot) -> ResourceSnapshot,
    {
        let mut mutator = mutator;
        loop {
            let slot = self.slot(name);
            match self.update_slot(&slot, name, default_type, mutator) {
                Ok(next) => return next,
                Err(m) => mutator = m,
            }
        }
    }

    fn update_slot<F>(&self, slot: &Slot, name: &str, default_type: &ResourceType, mutator: F) -> Result<Arc<ResourceSnapshot>, F>
    where
        F: FnOnce(&ResourceSnapshot) -> ResourceSnapshot,
    {
        let mut state = slot.state.lock();
        if state.retired {
            return Err(mutator);
        }

        let previous = slot.current.load_full();
        let placeholder;
        let base = match previous.as_deref() {
            Some(prev) => prev,
            None => {
                placeholder = ResourceSnapshot::placeholder(name, default_type.clone());
                &placeholder
            }
        };
        let mut next = mutator(base);
        next.name = name.to_string();
        if next.resource_type.is_unspecified() {
            next.resource_type = default_type.clone();
        }
        state.last_version += 1;
        next.version = state.last_version;

        match previous.as_deref() {
            Some(prev) if prev.state != next.state => {
                debug!(name = %name, from = %prev.state_text(), to = %next.state_text(), version = next.version, "resource changed state")
            }
            None => {
                if state.tombstone {
                    state.tombstone = false;
                    let left = self.tombstones.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                    metrics::gauge!("lookout_tombstones", left as f64);
                }
                let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::gauge!("lookout_resources_live", live as f64);
                debug!(name = %name, state = %next.state_text(), version = next.version, "resource added");
            }
            _ => trace!(name = %name, version = next.version, "resource updated"),
        }

        let next = Arc::new(next);
        slot.current.store(Some(Arc::clone(&next)));
        // Publish while still holding the slot lock so every watcher sees this
        // resource's versions in order.
        self.fanout.publish(Ok(ResourceChange::Upsert(Arc::clone(&next))));
        Ok(next)
    }

    /// Remove `name`. Returns the version consumed by the deletion, or `None`
    /// when the resource was not live.
    pub fn remove(&self, name: &str) -> Option<Version> {
        let slot = Arc::clone(self.slots.get(name)?.value());
        let version = {
            let mut state = slot.state.lock();
            slot.current.swap(None)?;
            state.last_version += 1;
            state.tombstone = true;
            let version = state.last_version;
            let live = self.live.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            metrics::gauge!("lookout_resources_live", live as f64);
            debug!(name = %name, version, "resource removed");
            self.fanout.publish(Ok(ResourceChange::Delete { name: name.to_string(), version }));
            version
        };
        let tombstones = self.tombstones.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("lookout_tombstones", tombstones as f64);
        if tombstones > self.max_tombstones {
            self.prune_tombstones();
        }
        Some(version)
    }

    /// Drop every deleted slot, raising the version floor past them.
    fn prune_tombstones(&self) {
        let mut pruned = 0usize;
        self.slots.retain(|_, slot| {
            let mut state = slot.state.lock();
            if slot.current.load().is_some() {
                return true;
            }
            state.retired = true;
            self.floor.fetch_max(state.last_version, Ordering::AcqRel);
            if state.tombstone {
                pruned += 1;
            }
            false
        });
        let left = self.tombstones.fetch_sub(pruned, Ordering::Relaxed).saturating_sub(pruned);
        metrics::gauge!("lookout_tombstones", left as f64);
        debug!(pruned, floor = self.floor.load(Ordering::Relaxed), "tombstones pruned");
    }

    /// Deleted names still remembered.
    pub fn tombstones(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all live snapshots, ordered by name.
    pub fn current(&self) -> Vec<Arc<ResourceSnapshot>> {
        let mut out: Vec<Arc<ResourceSnapshot>> =
            self.slots.iter().filter_map(|entry| entry.value().current.load_full()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceSnapshot>> {
        self.slots.get(name).and_then(|slot| slot.value().current.load_full())
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a watcher. Must happen before reading [`current`](Self::current)
    /// so nothing published in between is missed.
    pub fn watch(&self) -> Registration {
        Fanout::register(&self.fanout)
    }

    /// Deliver an error to every watcher; watchers treat it as terminal.
    pub fn publish_violation(&self, error: LookoutError) {
        self.fanout.publish(Err(error));
    }

    /// Detach all watchers; their queues end after draining. Later
    /// registrations start closed.
    pub fn close_watchers(&self) {
        self.fanout.close();
    }

    pub fn watcher_count(&self) -> usize {
        self.fanout.len()
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Notification>,
    backlog: Arc<AtomicUsize>,
}

/// Registry of per-watcher unbounded queues.
pub struct Fanout {
    next_id: AtomicU64,
    subscribers: RwLock<FxHashMap<u64, Subscriber>>,
    closed: AtomicBool,
    backlog_warn: usize,
}

impl Fanout {
    fn new(backlog_warn: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
            backlog_warn: backlog_warn.max(1),
        }
    }

    fn register(this: &Arc<Self>) -> Registration {
        let id = this.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        {
            let mut subs = this.subscribers.write();
            // Checked under the write lock so a concurrent close can't leave us registered.
            if !this.closed.load(Ordering::Acquire) {
                subs.insert(id, Subscriber { tx, backlog: Arc::clone(&backlog) });
            }
            metrics::gauge!("lookout_subscribers", subs.len() as f64);
        }
        trace!(id, "watcher registered");
        Registration { id, fanout: Arc::clone(this), rx, backlog }
    }

    fn unregister(&self, id: u64) {
        let mut subs = self.subscribers.write();
        if subs.remove(&id).is_some() {
            metrics::gauge!("lookout_subscribers", subs.len() as f64);
            trace!(id, "watcher detached");
        }
    }

    fn publish(&self, item: Notification) {
        let subs = self.subscribers.read();
        for (id, sub) in subs.iter() {
            let depth = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if depth == self.backlog_warn {
                warn!(id = *id, backlog = depth, "watcher is falling behind");
                metrics::counter!("lookout_slow_subscriber_total", 1u64);
            }
            if sub.tx.send(item.clone()).is_err() {
                sub.backlog.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut subs = self.subscribers.write();
        let n = subs.len();
        subs.clear();
        metrics::gauge!("lookout_subscribers", 0.0);
        debug!(watchers = n, "watchers closed");
    }

    fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Receiving end of one watcher. Dropping it detaches the watcher.
pub struct Registration {
    id: u64,
    fanout: Arc<Fanout>,
    rx: mpsc::UnboundedReceiver<Notification>,
    backlog: Arc<AtomicUsize>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next notification; `None` once the store closed its watchers. Cancel safe.
    pub async fn recv(&mut self) -> Option<Notification> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Notifications queued but not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.fanout.unregister(self.id);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).field("backlog", &self.backlog()).finish()
    }
}
