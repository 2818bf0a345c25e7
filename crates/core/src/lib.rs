//! Lookout core types: resource snapshots, changes and the source adapter contract.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod snapshot;

pub use snapshot::{
    Command, CommandState, EnvVar, HealthReport, HealthStatus, Property, Relationship, ResourceSnapshot, ResourceType,
    Url, Version, Volume,
};

/// Errors surfaced to consumers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LookoutError {
    #[error("malformed change: {0}")]
    MalformedChange(String),
    #[error("protocol violation from source {adapter}: {reason}")]
    ProtocolViolation { adapter: String, reason: String },
}

pub type LookoutResult<T> = Result<T, LookoutError>;

/// Change as reported by a source adapter.
///
/// Mirrors the dashboard wire shape: exactly one of `upsert` / `delete` must
/// be populated. Anything else is a protocol violation, see [`WatchChange::into_kind`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchChange {
    pub upsert: Option<ResourceSnapshot>,
    /// Name of the deleted resource.
    pub delete: Option<String>,
}

/// Validated adapter change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Upsert(ResourceSnapshot),
    Delete(String),
}

impl ChangeKind {
    pub fn name(&self) -> &str {
        match self {
            ChangeKind::Upsert(s) => &s.name,
            ChangeKind::Delete(n) => n,
        }
    }
}

impl WatchChange {
    pub fn upsert(snapshot: ResourceSnapshot) -> Self {
        Self { upsert: Some(snapshot), delete: None }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self { upsert: None, delete: Some(name.into()) }
    }

    pub fn into_kind(self) -> LookoutResult<ChangeKind> {
        match (self.upsert, self.delete) {
            (Some(s), None) if s.name.is_empty() => {
                Err(LookoutError::MalformedChange("upsert carries a resource without a name".into()))
            }
            (Some(s), None) => Ok(ChangeKind::Upsert(s)),
            (None, Some(n)) if n.is_empty() => {
                Err(LookoutError::MalformedChange("delete carries an empty resource name".into()))
            }
            (None, Some(n)) => Ok(ChangeKind::Delete(n)),
            (None, None) => Err(LookoutError::MalformedChange("change has neither upsert nor delete populated".into())),
            (Some(s), Some(n)) => Err(LookoutError::MalformedChange(format!(
                "change has both upsert ({}) and delete ({}) populated",
                s.name, n
            ))),
        }
    }
}

/// Versioned change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceChange {
    Upsert(Arc<ResourceSnapshot>),
    /// Deletion consumes a version of its own, so it orders against upserts.
    Delete { name: String, version: Version },
}

impl ResourceChange {
    pub fn name(&self) -> &str {
        match self {
            ResourceChange::Upsert(s) => &s.name,
            ResourceChange::Delete { name, .. } => name,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            ResourceChange::Upsert(s) => s.version,
            ResourceChange::Delete { version, .. } => *version,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ResourceChange::Delete { .. })
    }
}

/// One line of resource log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
    pub is_stderr: bool,
}

impl LogLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_stderr: false }
    }
}

pub type ChangeStream = BoxStream<'static, anyhow::Result<WatchChange>>;
pub type LogStream = BoxStream<'static, LogLine>;

/// Contract every infrastructure source implements.
///
/// Failures are expected: the engine treats a failed listing as "no resources"
/// and a failed change stream as the end of that source's contribution.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short stable label used in logs and metrics ("kubernetes", "docker").
    fn kind(&self) -> &str;

    /// Resource type assigned to snapshots that don't carry one.
    fn default_resource_type(&self) -> ResourceType;

    async fn list_initial(&self) -> anyhow::Result<Vec<ResourceSnapshot>>;

    /// Live upsert/delete changes for resources this source owns.
    async fn watch(&self) -> anyhow::Result<ChangeStream>;

    /// Follow the log of one resource. Ends when the resource's output ends.
    async fn stream_logs(&self, resource_name: &str) -> anyhow::Result<LogStream>;
}
