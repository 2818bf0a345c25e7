//! Lookout dashboard façade.
//!
//! Frontends (CLI, dashboards) depend on the [`DashboardApi`] trait and its
//! message types only. [`EngineApi`] serves it from an in-process engine,
//! [`MockApi`] from canned data.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use lookout_core::{LogLine, ResourceChange, ResourceSnapshot};
use lookout_engine::{ChangeFeed, NotificationEngine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInformation {
    pub application_name: String,
    pub application_version: String,
}

impl Default for ApplicationInformation {
    fn default() -> Self {
        Self { application_name: "lookout".into(), application_version: env!("CARGO_PKG_VERSION").into() }
    }
}

/// Message on a resource watch.
///
/// Exactly one `InitialData` opens every watch; `Changes` follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchUpdate {
    InitialData(Vec<Arc<ResourceSnapshot>>),
    Changes(Vec<ResourceChange>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberedLine {
    /// 1-based, counted per log watch.
    pub line_number: u64,
    pub text: String,
    pub is_stderr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogBatch {
    pub lines: Vec<NumberedLine>,
}

/// API errors suitable for transport to remote frontends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    /// A source broke the change contract; the watch cannot continue.
    #[error("contract: {0}")]
    Contract(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Dashboard-facing surface.
#[async_trait::async_trait]
pub trait DashboardApi: Send + Sync {
    async fn application_information(&self) -> ApiResult<ApplicationInformation>;

    /// Initial data followed by change batches, until the engine stops or
    /// the stream is dropped. An `Err` item is the last one.
    async fn watch_resources(&self) -> ApiResult<BoxStream<'static, ApiResult<WatchUpdate>>>;

    /// Log batches for `name`. Unknown resources produce an empty stream.
    async fn watch_resource_logs(&self, name: &str) -> ApiResult<BoxStream<'static, LogBatch>>;
}

// ----------------- In-process implementation -----------------

/// Serves the dashboard API from a running [`NotificationEngine`].
pub struct EngineApi {
    engine: Arc<NotificationEngine>,
    info: ApplicationInformation,
}

impl EngineApi {
    pub fn new(engine: Arc<NotificationEngine>) -> Self {
        Self { engine, info: ApplicationInformation::default() }
    }

    pub fn engine(&self) -> &Arc<NotificationEngine> {
        &self.engine
    }
}

enum Phase {
    Initial(Vec<Arc<ResourceSnapshot>>, ChangeFeed),
    Live(ChangeFeed),
    /// Batch already sent; the error goes out next.
    Failed(ApiError),
    Done,
}

/// Emit the next watch message, batching whatever changes are ready.
async fn step(phase: Phase, batch_max: usize) -> Option<(ApiResult<WatchUpdate>, Phase)> {
    match phase {
        Phase::Initial(initial, feed) => Some((Ok(WatchUpdate::InitialData(initial)), Phase::Live(feed))),
        Phase::Failed(e) => Some((Err(e), Phase::Done)),
        Phase::Done => None,
        Phase::Live(mut feed) => {
            let first = match feed.next().await? {
                Ok(change) => change,
                Err(e) => return Some((Err(ApiError::Contract(e.to_string())), Phase::Done)),
            };
            let mut batch = vec![first];
            let mut next_phase = None;
            while batch.len() < batch_max {
                match feed.next().now_or_never() {
                    Some(Some(Ok(change))) => batch.push(change),
                    Some(Some(Err(e))) => {
                        next_phase = Some(Phase::Failed(ApiError::Contract(e.to_string())));
                        break;
                    }
                    Some(None) => {
                        next_phase = Some(Phase::Done);
                        break;
                    }
                    None => break,
                }
            }
            debug!(changes = batch.len(), "change batch ready");
            Some((Ok(WatchUpdate::Changes(batch)), next_phase.unwrap_or(Phase::Live(feed))))
        }
    }
}

fn number_lines(lines: impl futures::Stream<Item = LogLine> + Send + 'static, batch_max: usize) -> BoxStream<'static, LogBatch> {
    lines
        .enumerate()
        .map(|(i, line)| NumberedLine { line_number: i as u64 + 1, text: line.text, is_stderr: line.is_stderr })
        .ready_chunks(batch_max.max(1))
        .map(|lines| LogBatch { lines })
        .boxed()
}

#[async_trait::async_trait]
impl DashboardApi for EngineApi {
    async fn application_information(&self) -> ApiResult<ApplicationInformation> {
        Ok(self.info.clone())
    }

    async fn watch_resources(&self) -> ApiResult<BoxStream<'static, ApiResult<WatchUpdate>>> {
        if self.engine.is_shutdown() {
            return Err(ApiError::Unavailable("engine is shut down".into()));
        }
        let sub = self.engine.subscribe();
        info!(resources = sub.initial.len(), "dashboard watch started");
        let batch_max = self.engine.config().batch_max.max(1);
        let updates = stream::unfold(Phase::Initial(sub.initial, sub.changes), move |phase| step(phase, batch_max));
        Ok(updates
            .inspect(|u| {
                if let Err(e) = u {
                    warn!(error = %e, "dashboard watch aborted");
                }
            })
            .boxed())
    }

    async fn watch_resource_logs(&self, name: &str) -> ApiResult<BoxStream<'static, LogBatch>> {
        let lines = self.engine.stream_logs(name).await;
        debug!(name = %name, "dashboard log watch started");
        Ok(number_lines(lines, self.engine.config().log_batch_max))
    }
}

// ----------------- Mock implementation -----------------

/// Canned responses for frontend tests.
#[derive(Debug, Clone, Default)]
pub struct MockApi {
    pub info: ApplicationInformation,
    pub updates: Vec<ApiResult<WatchUpdate>>,
    pub logs: HashMap<String, Vec<LogLine>>,
    pub log_batch_max: Option<usize>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DashboardApi for MockApi {
    async fn application_information(&self) -> ApiResult<ApplicationInformation> {
        Ok(self.info.clone())
    }

    async fn watch_resources(&self) -> ApiResult<BoxStream<'static, ApiResult<WatchUpdate>>> {
        Ok(stream::iter(self.updates.clone()).boxed())
    }

    async fn watch_resource_logs(&self, name: &str) -> ApiResult<BoxStream<'static, LogBatch>> {
        let lines = self.logs.get(name).cloned().unwrap_or_default();
        Ok(number_lines(stream::iter(lines), self.log_batch_max.unwrap_or(usize::MAX)))
    }
}
