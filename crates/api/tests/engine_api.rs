use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lookout_api::{ApiError, DashboardApi, EngineApi, WatchUpdate};
use lookout_core::{ChangeStream, LogLine, LogStream, ResourceSnapshot, ResourceType, SourceAdapter, WatchChange};
use lookout_engine::{EngineConfig, NotificationEngine};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Feed {
    initial: Vec<ResourceSnapshot>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<WatchChange>>>,
    logs: Vec<String>,
}

#[async_trait::async_trait]
impl SourceAdapter for Feed {
    fn kind(&self) -> &str {
        "feed"
    }

    fn default_resource_type(&self) -> ResourceType {
        ResourceType::Container
    }

    async fn list_initial(&self) -> anyhow::Result<Vec<ResourceSnapshot>> {
        Ok(self.initial.clone())
    }

    async fn watch(&self) -> anyhow::Result<ChangeStream> {
        let rx = self.rx.lock().take().ok_or_else(|| anyhow::anyhow!("watched twice"))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|c| (Ok(c), rx)) }).boxed())
    }

    async fn stream_logs(&self, _resource_name: &str) -> anyhow::Result<LogStream> {
        Ok(futures::stream::iter(self.logs.clone().into_iter().map(LogLine::stdout)).boxed())
    }
}

async fn api_with(initial: &[&str], logs: &[&str], config: EngineConfig) -> (EngineApi, mpsc::UnboundedSender<WatchChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let feed = Feed {
        initial: initial.iter().map(|n| ResourceSnapshot::new(*n).with_state("running")).collect(),
        rx: Mutex::new(Some(rx)),
        logs: logs.iter().map(|l| l.to_string()).collect(),
    };
    let engine = NotificationEngine::start(vec![Arc::new(feed)], config, CancellationToken::new()).await;
    (EngineApi::new(Arc::new(engine)), tx)
}

async fn next<S: futures::Stream + Unpin>(s: &mut S) -> Option<S::Item> {
    tokio::time::timeout(Duration::from_secs(2), s.next()).await.expect("timed out")
}

#[tokio::test]
async fn watch_opens_with_initial_data_then_batches() {
    let (api, tx) = api_with(&["web"], &[], EngineConfig::default()).await;
    let mut updates = api.watch_resources().await.unwrap();

    match next(&mut updates).await {
        Some(Ok(WatchUpdate::InitialData(init))) => {
            assert_eq!(init.len(), 1);
            assert_eq!(init[0].name, "web");
        }
        other => panic!("expected initial data, got {other:?}"),
    }

    for i in 0..3 {
        tx.send(WatchChange::upsert(ResourceSnapshot::new("web").with_state(format!("s{i}")))).unwrap();
    }
    let mut versions = Vec::new();
    while versions.len() < 3 {
        match next(&mut updates).await {
            Some(Ok(WatchUpdate::Changes(batch))) => versions.extend(batch.iter().map(|c| c.version())),
            other => panic!("expected changes, got {other:?}"),
        }
    }
    assert_eq!(versions, vec![2, 3, 4]);
}

#[tokio::test]
async fn batches_respect_max_size() {
    let config = EngineConfig { batch_max: 2, ..EngineConfig::default() };
    let (api, tx) = api_with(&[], &[], config).await;
    let engine = Arc::clone(api.engine());
    let mut updates = api.watch_resources().await.unwrap();
    assert!(matches!(next(&mut updates).await, Some(Ok(WatchUpdate::InitialData(_)))));

    for i in 0..5 {
        tx.send(WatchChange::upsert(ResourceSnapshot::new(format!("r{i}")))).unwrap();
    }
    while engine.resources().len() < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut seen = 0;
    while seen < 5 {
        match next(&mut updates).await {
            Some(Ok(WatchUpdate::Changes(batch))) => {
                assert!(!batch.is_empty() && batch.len() <= 2, "batch of {}", batch.len());
                seen += batch.len();
            }
            other => panic!("expected changes, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn malformed_change_aborts_watch_with_contract_error() {
    let (api, tx) = api_with(&["web"], &[], EngineConfig::default()).await;
    let mut updates = api.watch_resources().await.unwrap();
    next(&mut updates).await;

    tx.send(WatchChange::default()).unwrap();
    loop {
        match next(&mut updates).await {
            Some(Ok(WatchUpdate::Changes(_))) => continue,
            Some(Err(ApiError::Contract(msg))) => {
                assert!(msg.contains("neither upsert nor delete"), "{msg}");
                break;
            }
            other => panic!("expected contract error, got {other:?}"),
        }
    }
    assert!(next(&mut updates).await.is_none());
}

#[tokio::test]
async fn logs_are_numbered_per_watch() {
    let (api, _tx) = api_with(&["web"], &["one", "two", "three"], EngineConfig::default()).await;
    let batches: Vec<_> = api.watch_resource_logs("web").await.unwrap().collect().await;
    let lines: Vec<(u64, String)> =
        batches.into_iter().flat_map(|b| b.lines).map(|l| (l.line_number, l.text)).collect();
    assert_eq!(lines, vec![(1, "one".to_string()), (2, "two".to_string()), (3, "three".to_string())]);

    let none: Vec<_> = api.watch_resource_logs("missing").await.unwrap().collect().await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn watch_after_shutdown_is_unavailable() {
    let (api, _tx) = api_with(&[], &[], EngineConfig::default()).await;
    api.engine().shutdown();
    assert!(matches!(api.watch_resources().await, Err(ApiError::Unavailable(_))));
}
