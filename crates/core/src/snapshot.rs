//! Canonical resource model shared by every source adapter.
//!
//! Everything below `ResourceSnapshot::version` is payload: the engine never
//! interprets it, it only stores the latest copy and forwards it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-resource version assigned by the store. `0` means "not seen yet".
pub type Version = u64;

/// Resource type tag. Adapters supply an explicit default for snapshots that
/// leave it `Unspecified`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Unspecified,
    /// Plain container managed by a container runtime.
    Container,
    /// Container derived from an orchestrator pod.
    PodContainer,
    Other(String),
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Unspecified => "",
            ResourceType::Container => "Container",
            ResourceType::PodContainer => "PodContainer",
            ResourceType::Other(s) => s.as_str(),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            ResourceType::Unspecified => true,
            ResourceType::Other(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Url {
    pub name: String,
    pub full_url: String,
    pub is_internal: bool,
    pub is_inactive: bool,
    pub display_name: String,
    pub sort_order: i32,
}

impl Url {
    pub fn external(name: impl Into<String>, full_url: impl Into<String>) -> Self {
        Self { name: name.into(), full_url: full_url.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: Option<String>,
    pub is_from_spec: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: serde_json::Value,
    pub is_sensitive: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self { name: name.into(), value: value.into(), is_sensitive: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub key: String,
    pub status: Option<HealthStatus>,
    pub description: String,
    pub exception: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub resource_name: String,
    /// Relationship kind, e.g. "Parent" or "Reference".
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandState {
    #[default]
    Enabled,
    Disabled,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub display_name: String,
    pub display_description: String,
    pub confirmation_message: String,
    pub icon_name: String,
    pub is_highlighted: bool,
    pub state: CommandState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Volume {
    pub source: String,
    pub target: String,
    pub mount_type: String,
    pub is_read_only: bool,
}

/// Observed state of one resource at one version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Stable external key; unique across all sources.
    pub name: String,
    pub resource_type: ResourceType,
    pub display_name: String,
    pub uid: String,
    /// Free-form status text ("Running", "exited", ...).
    pub state: Option<String>,
    /// Presentation hint for `state`.
    pub state_style: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub urls: Vec<Url>,
    pub environment: Vec<EnvVar>,
    pub properties: Vec<Property>,
    pub health_reports: Vec<HealthReport>,
    pub relationships: Vec<Relationship>,
    pub commands: Vec<Command>,
    pub volumes: Vec<Volume>,
    /// Assigned by the store; whatever an adapter puts here is overwritten.
    pub version: Version,
}

impl ResourceSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { display_name: name.clone(), name, ..Default::default() }
    }

    /// Empty state a first update is applied to.
    pub fn placeholder(name: &str, resource_type: ResourceType) -> Self {
        Self { resource_type, ..Self::new(name) }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn state_text(&self) -> &str {
        self.state.as_deref().unwrap_or("")
    }

    /// Fill fields an adapter left empty from the previous snapshot of the
    /// same resource. Only identity and creation metadata carry over.
    pub fn inherit(mut self, previous: &ResourceSnapshot) -> Self {
        if self.creation_time.is_none() {
            self.creation_time = previous.creation_time;
        }
        if self.uid.is_empty() {
            self.uid = previous.uid.clone();
        }
        if self.display_name.is_empty() {
            self.display_name = previous.display_name.clone();
        }
        if self.resource_type.is_unspecified() {
            self.resource_type = previous.resource_type.clone();
        }
        self
    }
}
