use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use lookout_core::{ChangeKind, LogStream, ResourceSnapshot, SourceAdapter};
use lookout_store::VersionedStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::mux::{Multiplexer, MuxEvent};
use crate::routes::{RoutingMap, SourceId};
use crate::subscription::{ChangeFeed, Subscription, VersionGate};
use crate::EngineConfig;

/// Aggregates every registered source into one versioned view.
///
/// Sources are fixed at [`start`](Self::start). Subscribers get the current
/// state followed by live changes; log requests are routed to the source that
/// last reported the resource.
pub struct NotificationEngine {
    sources: Arc<[Arc<dyn SourceAdapter>]>,
    store: Arc<VersionedStore>,
    routes: Arc<RoutingMap>,
    cancel: CancellationToken,
    ingest: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
}

impl NotificationEngine {
    /// List every source's initial resources, seed the store and start
    /// following changes. A source whose listing fails contributes nothing.
    ///
    /// Cancelling `cancel` shuts the engine down.
    pub async fn start(adapters: Vec<Arc<dyn SourceAdapter>>, config: EngineConfig, cancel: CancellationToken) -> Self {
        let sources: Arc<[Arc<dyn SourceAdapter>]> = adapters.into();
        let store = Arc::new(VersionedStore::with_backlog_warn(config.backlog_warn));
        let routes = Arc::new(RoutingMap::new());

        info!(sources = sources.len(), "getting initial resources from sources");
        let t0 = Instant::now();
        let listings = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("engine cancelled during startup listing");
                Vec::new()
            }
            all = futures::future::join_all(sources.iter().enumerate().map(|(i, adapter)| async move {
                (SourceId(i), adapter.list_initial().await)
            })) => all,
        };

        let mut total = 0usize;
        for (id, listing) in listings {
            let adapter = &sources[id.0];
            match listing {
                Ok(resources) => {
                    debug!(source = %adapter.kind(), count = resources.len(), "source returned resources");
                    for snapshot in resources {
                        if seed(&store, &routes, id, adapter.as_ref(), snapshot) {
                            total += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(source = %adapter.kind(), error = ?e, "failed to get resources from source; continuing without it");
                    metrics::counter!("lookout_source_failures_total", 1u64, "source" => adapter.kind().to_string());
                }
            }
        }
        metrics::histogram!("lookout_initial_listing_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(total, sources = sources.len(), took_ms = %t0.elapsed().as_millis(), "aggregated initial resources");

        let mux = Multiplexer::spawn(&sources, Arc::clone(&routes), cancel.child_token());
        let ingest = tokio::spawn(ingest(mux, Arc::clone(&sources), Arc::clone(&store), cancel.clone()));

        Self { sources, store, routes, cancel, ingest: Mutex::new(Some(ingest)), config }
    }

    /// Current state plus a feed of everything that changes after it.
    ///
    /// Each call is independent; a slow consumer only grows its own queue.
    pub fn subscribe(&self) -> Subscription {
        // Attach before reading so nothing published in between is lost.
        let registration = self.store.watch();
        let initial = self.store.current();
        let gate = VersionGate::record(&initial);
        debug!(id = registration.id(), resources = initial.len(), "subscriber attached");
        Subscription { initial, changes: ChangeFeed::new(registration, gate, self.cancel.child_token()) }
    }

    /// Follow the log of `name` on the source that owns it.
    ///
    /// Unknown resources and source failures yield an empty stream. The
    /// stream also ends when the engine shuts down; drop it to stop early.
    pub async fn stream_logs(&self, name: &str) -> LogStream {
        let Some(id) = self.routes.get(name) else {
            debug!(name = %name, "no source found for resource; no logs");
            return stream::empty().boxed();
        };
        let adapter = &self.sources[id.0];
        debug!(name = %name, source = %adapter.kind(), "routing logs to source");
        match adapter.stream_logs(name).await {
            Ok(lines) => lines.take_until(self.cancel.clone().cancelled_owned()).boxed(),
            Err(e) => {
                warn!(name = %name, source = %adapter.kind(), error = ?e, "source could not stream logs");
                stream::empty().boxed()
            }
        }
    }

    /// Snapshot of all live resources, ordered by name.
    pub fn resources(&self) -> Vec<Arc<ResourceSnapshot>> {
        self.store.current()
    }

    /// Kind of the source currently owning `name`.
    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.routes.get(name).map(|id| self.sources[id.0].kind())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscriber_count(&self) -> usize {
        self.store.watcher_count()
    }

    /// Stop readers, ingest and every subscriber feed.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until ingestion has stopped, either after [`shutdown`](Self::shutdown)
    /// or because every source's change stream ended.
    pub async fn closed(&self) {
        let handle = self.ingest.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest task did not finish cleanly");
            }
        }
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn seed(store: &VersionedStore, routes: &RoutingMap, id: SourceId, adapter: &dyn SourceAdapter, snapshot: ResourceSnapshot) -> bool {
    if snapshot.name.is_empty() {
        warn!(source = %adapter.kind(), "initial resource without a name skipped");
        return false;
    }
    routes.insert(&snapshot.name, id);
    let name = snapshot.name.clone();
    store.update(&name, &adapter.default_resource_type(), move |prev| snapshot.inherit(prev));
    true
}

async fn ingest(
    mut mux: Multiplexer,
    sources: Arc<[Arc<dyn SourceAdapter>]>,
    store: Arc<VersionedStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("engine cancelled; ingest stopping");
                break;
            }
            ev = mux.next() => ev,
        };
        let Some(event) = event else {
            info!("all source change streams completed");
            break;
        };
        apply(&store, &sources, event);
    }
    store.close_watchers();
}

fn apply(store: &VersionedStore, sources: &[Arc<dyn SourceAdapter>], event: MuxEvent) {
    match event {
        MuxEvent::Change { source, change: ChangeKind::Upsert(snapshot) } => {
            let adapter = &sources[source.0];
            let name = snapshot.name.clone();
            let stored = store.update(&name, &adapter.default_resource_type(), move |prev| snapshot.inherit(prev));
            trace!(source = %adapter.kind(), name = %name, version = stored.version, "upsert applied");
            metrics::counter!("lookout_changes_total", 1u64, "source" => adapter.kind().to_string(), "kind" => "upsert");
        }
        MuxEvent::Change { source, change: ChangeKind::Delete(name) } => {
            let adapter = &sources[source.0];
            match store.remove(&name) {
                Some(version) => {
                    trace!(source = %adapter.kind(), name = %name, version, "delete applied");
                    metrics::counter!("lookout_changes_total", 1u64, "source" => adapter.kind().to_string(), "kind" => "delete");
                }
                None => debug!(source = %adapter.kind(), name = %name, "delete for unknown resource ignored"),
            }
        }
        MuxEvent::Violation { source, error } => {
            warn!(source = %sources[source.0].kind(), error = %error, "aborting subscriptions after protocol violation");
            metrics::counter!("lookout_protocol_violations_total", 1u64, "source" => sources[source.0].kind().to_string());
            store.publish_violation(error);
        }
    }
}
