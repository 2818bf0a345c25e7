//! Fan-in of every source's change stream.
//!
//! One reader task per source. Readers validate and tag changes, keep the
//! routing map current, and forward into a single unbounded queue, so a slow
//! or dead source never holds up the others. The queue closes once every
//! reader has finished.

use std::sync::Arc;

use futures::StreamExt;
use lookout_core::{ChangeKind, LookoutError, SourceAdapter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::routes::{RoutingMap, SourceId};

/// Item produced by the multiplexer.
#[derive(Debug)]
pub enum MuxEvent {
    Change { source: SourceId, change: ChangeKind },
    /// The source sent something that is not a valid change.
    Violation { source: SourceId, error: LookoutError },
}

pub struct Multiplexer {
    rx: mpsc::UnboundedReceiver<MuxEvent>,
}

impl Multiplexer {
    /// Start one reader per source. Readers stop when `cancel` fires.
    pub fn spawn(sources: &[Arc<dyn SourceAdapter>], routes: Arc<RoutingMap>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for (i, adapter) in sources.iter().enumerate() {
            tokio::spawn(read_source(SourceId(i), Arc::clone(adapter), Arc::clone(&routes), tx.clone(), cancel.child_token()));
        }
        debug!(sources = sources.len(), "multiplexer started");
        Self { rx }
    }

    /// Next merged event; `None` once every reader is done.
    pub async fn next(&mut self) -> Option<MuxEvent> {
        self.rx.recv().await
    }
}

async fn read_source(
    id: SourceId,
    adapter: Arc<dyn SourceAdapter>,
    routes: Arc<RoutingMap>,
    tx: mpsc::UnboundedSender<MuxEvent>,
    cancel: CancellationToken,
) {
    let kind = adapter.kind().to_string();
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(source = %kind, "reader cancelled before change stream opened");
            return;
        }
        res = adapter.watch() => res,
    };
    let mut stream = match opened {
        Ok(s) => s,
        Err(e) => {
            warn!(source = %kind, error = ?e, "change stream unavailable; source contributes no changes");
            metrics::counter!("lookout_source_failures_total", 1u64, "source" => kind.clone());
            return;
        }
    };
    info!(source = %kind, "watching source changes");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(source = %kind, "reader cancelled");
                break;
            }
            n = stream.next() => n,
        };
        let event = match next {
            None => {
                info!(source = %kind, "change stream ended");
                break;
            }
            Some(Err(e)) => {
                error!(source = %kind, error = ?e, "error reading change stream; source isolated");
                metrics::counter!("lookout_source_failures_total", 1u64, "source" => kind.clone());
                break;
            }
            Some(Ok(change)) => match change.into_kind() {
                Ok(change) => {
                    match &change {
                        ChangeKind::Upsert(s) => routes.insert(&s.name, id),
                        ChangeKind::Delete(name) => {
                            routes.remove(name);
                        }
                    }
                    MuxEvent::Change { source: id, change }
                }
                Err(e) => {
                    error!(source = %kind, error = %e, "source sent a malformed change");
                    MuxEvent::Violation {
                        source: id,
                        error: LookoutError::ProtocolViolation { adapter: kind.clone(), reason: e.to_string() },
                    }
                }
            },
        };
        if tx.send(event).is_err() {
            debug!(source = %kind, "multiplexer output dropped; reader stopping");
            break;
        }
    }
}
