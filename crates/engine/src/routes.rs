//! Resource name → owning source lookup used to dispatch log requests.

use dashmap::DashMap;
use tracing::{trace, warn};

/// Index of a registered source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);

#[derive(Debug, Default)]
pub struct RoutingMap {
    routes: DashMap<String, SourceId>,
}

impl RoutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `name` at `source`. A name already owned by another source is
    /// taken over (last writer wins).
    pub fn insert(&self, name: &str, source: SourceId) {
        match self.routes.insert(name.to_string(), source) {
            Some(prev) if prev != source => {
                warn!(name = %name, from = prev.0, to = source.0, "resource name reported by two sources; last writer wins")
            }
            Some(_) => {}
            None => trace!(name = %name, source = source.0, "route added"),
        }
    }

    pub fn remove(&self, name: &str) -> Option<SourceId> {
        let removed = self.routes.remove(name).map(|(_, id)| id);
        if removed.is_some() {
            trace!(name = %name, "route removed");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<SourceId> {
        self.routes.get(name).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
