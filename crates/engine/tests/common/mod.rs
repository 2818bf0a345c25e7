#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lookout_core::{ChangeStream, LogLine, LogStream, ResourceChange, ResourceSnapshot, ResourceType, SourceAdapter, WatchChange};
use lookout_engine::ChangeFeed;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Source driven by the test through a [`Script`] handle.
pub struct ScriptedAdapter {
    kind: &'static str,
    initial: Mutex<Option<anyhow::Result<Vec<ResourceSnapshot>>>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Result<WatchChange>>>>,
    logs: HashMap<String, Vec<String>>,
}

/// Sending side of a scripted change stream. Dropping it ends the stream.
#[derive(Clone)]
pub struct Script {
    tx: mpsc::UnboundedSender<anyhow::Result<WatchChange>>,
}

impl Script {
    pub fn upsert(&self, snapshot: ResourceSnapshot) {
        let _ = self.tx.send(Ok(WatchChange::upsert(snapshot)));
    }

    pub fn delete(&self, name: &str) {
        let _ = self.tx.send(Ok(WatchChange::delete(name)));
    }

    pub fn raw(&self, change: WatchChange) {
        let _ = self.tx.send(Ok(change));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(anyhow::anyhow!(reason.to_string())));
    }
}

pub struct Builder {
    kind: &'static str,
    initial: anyhow::Result<Vec<ResourceSnapshot>>,
    logs: HashMap<String, Vec<String>>,
}

impl Builder {
    pub fn initial(mut self, names: &[(&str, &str)]) -> Self {
        self.initial = Ok(names.iter().map(|(n, state)| ResourceSnapshot::new(*n).with_state(*state)).collect());
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.initial = Err(anyhow::anyhow!("{} unavailable", self.kind));
        self
    }

    pub fn logs(mut self, name: &str, lines: &[&str]) -> Self {
        self.logs.insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn build(self) -> (Arc<dyn SourceAdapter>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = ScriptedAdapter {
            kind: self.kind,
            initial: Mutex::new(Some(self.initial)),
            changes: Mutex::new(Some(rx)),
            logs: self.logs,
        };
        (Arc::new(adapter), Script { tx })
    }
}

pub fn source(kind: &'static str) -> Builder {
    Builder { kind, initial: Ok(Vec::new()), logs: HashMap::new() }
}

#[async_trait::async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> &str {
        self.kind
    }

    fn default_resource_type(&self) -> ResourceType {
        ResourceType::Container
    }

    async fn list_initial(&self) -> anyhow::Result<Vec<ResourceSnapshot>> {
        self.initial.lock().take().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn watch(&self) -> anyhow::Result<ChangeStream> {
        let rx = self.changes.lock().take();
        let Some(mut rx) = rx else {
            anyhow::bail!("{} already watched", self.kind);
        };
        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }

    async fn stream_logs(&self, resource_name: &str) -> anyhow::Result<LogStream> {
        let lines = self.logs.get(resource_name).cloned().unwrap_or_default();
        let kind = self.kind;
        Ok(futures::stream::iter(lines.into_iter().map(move |l| LogLine::stdout(format!("[{kind}] {l}")))).boxed())
    }
}

pub async fn next_change(feed: &mut ChangeFeed) -> ResourceChange {
    match tokio::time::timeout(Duration::from_secs(2), feed.next()).await {
        Ok(Some(Ok(change))) => change,
        other => panic!("expected a change, got {other:?}"),
    }
}

/// Asserts nothing arrives for a short while.
pub async fn assert_quiet(feed: &mut ChangeFeed) {
    if let Ok(item) = tokio::time::timeout(Duration::from_millis(100), feed.next()).await {
        panic!("expected no change, got {item:?}");
    }
}
