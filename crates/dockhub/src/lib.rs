//! Lookout dockhub: local Docker containers as a resource source.
//!
//! Every container the daemon knows about, running or not, is one resource
//! named after the container. Container events drive the change stream.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use bollard::container::{ListContainersOptions, LogOutput, LogsOptions};
use bollard::models::{ContainerSummary, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use lookout_core::{ChangeStream, LogLine, LogStream, Property, ResourceSnapshot, ResourceType, SourceAdapter, Url, WatchChange};
use tracing::{debug, info, warn};

/// Container name as Docker reports it, without the leading `/`.
fn container_name(summary: &ContainerSummary) -> Option<&str> {
    let first = summary.names.as_ref()?.first()?;
    Some(first.trim_start_matches('/')).filter(|n| !n.is_empty())
}

/// Display state and style for a daemon state string.
fn state_of(state: Option<&str>) -> (&'static str, &'static str) {
    match state {
        Some("running") => ("Running", "success"),
        Some("exited") => ("Exited", "warn"),
        _ => ("Hidden", "error"),
    }
}

/// Snapshot for one listed container; `None` when it has no usable name.
pub fn snapshot_from_summary(summary: &ContainerSummary) -> Option<ResourceSnapshot> {
    let name = container_name(summary)?;
    let (state, style) = state_of(summary.state.as_deref());
    let mut s = ResourceSnapshot::new(name).with_type(ResourceType::Container).with_state(state);
    s.state_style = Some(style.to_string());
    s.uid = summary.id.clone().unwrap_or_default();
    let created = summary.created.and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
    s.creation_time = created;
    s.start_time = created;

    let mut published = Vec::new();
    for port in summary.ports.iter().flatten() {
        let (Some(ip), Some(public)) = (port.ip.as_deref(), port.public_port) else { continue };
        if ip.is_empty() {
            continue;
        }
        let endpoint = format!("http://{ip}:{public}");
        s.urls.push(Url::external(endpoint.clone(), endpoint));
        published.push(format!("{public}->{}", port.private_port));
    }

    s.properties = vec![
        Property::new("container.id", s.uid.clone()),
        Property::new("container.image", summary.image.clone().unwrap_or_default()),
        Property::new("container.ports", published.join(", ")),
    ];
    if let Some(status) = summary.status.as_deref() {
        s.properties.push(Property::new("container.status", status));
    }
    Some(s)
}

/// What a daemon event means for the resource set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEvent {
    /// Re-read the container with this id and upsert it.
    Refresh(String),
    /// The container with this name is gone.
    Remove(String),
}

pub fn classify_event(ev: &EventMessage) -> Option<DockerEvent> {
    if ev.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let actor = ev.actor.as_ref()?;
    match ev.action.as_deref()? {
        "destroy" => {
            let name = actor.attributes.as_ref()?.get("name")?;
            Some(DockerEvent::Remove(name.trim_start_matches('/').to_string()))
        }
        "create" | "start" | "restart" | "stop" | "die" | "pause" | "unpause" | "rename" => {
            actor.id.clone().map(DockerEvent::Refresh)
        }
        _ => None,
    }
}

/// Split one log frame into lines. Stdin and console frames count as stdout.
pub fn log_lines(output: LogOutput) -> Vec<LogLine> {
    let (message, is_stderr) = match output {
        LogOutput::StdErr { message } => (message, true),
        LogOutput::StdOut { message } | LogOutput::StdIn { message } | LogOutput::Console { message } => (message, false),
    };
    let text = String::from_utf8_lossy(&message);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(|l| LogLine { text: l.trim_end_matches('\r').to_string(), is_stderr }).collect()
}

fn filters(key: &str, value: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([(key.to_string(), vec![value.to_string()])])
}

pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    /// Connect through the local socket (or `DOCKER_HOST`).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connecting to docker daemon")?;
        Ok(Self::with_client(docker))
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn list(docker: &Docker, filters: HashMap<String, Vec<String>>) -> Result<Vec<ContainerSummary>> {
        let opts = ListContainersOptions::<String> { all: true, filters, ..Default::default() };
        docker.list_containers(Some(opts)).await.context("listing docker containers")
    }
}

#[async_trait::async_trait]
impl SourceAdapter for DockerAdapter {
    fn kind(&self) -> &str {
        "docker"
    }

    fn default_resource_type(&self) -> ResourceType {
        ResourceType::Container
    }

    async fn list_initial(&self) -> Result<Vec<ResourceSnapshot>> {
        let containers = Self::list(&self.docker, HashMap::new()).await?;
        let snapshots: Vec<_> = containers.iter().filter_map(snapshot_from_summary).collect();
        info!(containers = snapshots.len(), "docker containers listed");
        Ok(snapshots)
    }

    async fn watch(&self) -> Result<ChangeStream> {
        let docker = self.docker.clone();
        let opts = EventsOptions::<String> { filters: filters("type", "container"), ..Default::default() };
        let events = self.docker.events(Some(opts)).filter_map(move |ev| {
            let docker = docker.clone();
            async move {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(e) => return Some(Err(anyhow::Error::new(e).context("docker event stream failed"))),
                };
                metrics::counter!("lookout_docker_events_total", 1u64);
                match classify_event(&ev)? {
                    DockerEvent::Remove(name) => {
                        debug!(name = %name, "docker container destroyed");
                        Some(Ok(WatchChange::delete(name)))
                    }
                    DockerEvent::Refresh(id) => match DockerAdapter::list(&docker, filters("id", &id)).await {
                        Ok(found) => {
                            let snapshot = found.iter().find(|c| c.id.as_deref() == Some(id.as_str())).and_then(snapshot_from_summary)?;
                            Some(Ok(WatchChange::upsert(snapshot)))
                        }
                        Err(e) => {
                            warn!(id = %id, error = %e, "refreshing docker container failed");
                            None
                        }
                    },
                }
            }
        });
        Ok(events.boxed())
    }

    async fn stream_logs(&self, resource_name: &str) -> Result<LogStream> {
        let found = Self::list(&self.docker, filters("name", resource_name)).await?;
        let id = found
            .iter()
            .find(|c| container_name(c) == Some(resource_name))
            .and_then(|c| c.id.clone())
            .ok_or_else(|| anyhow!("no docker container named {}", resource_name))?;
        debug!(name = %resource_name, id = %id, "docker log stream opened");

        let opts = LogsOptions::<String> { follow: true, stdout: true, stderr: true, ..Default::default() };
        let name = resource_name.to_string();
        let lines = self.docker.logs(&id, Some(opts)).scan((), move |_, frame| {
            let out = match frame {
                Ok(frame) => Some(futures::stream::iter(log_lines(frame))),
                Err(e) => {
                    warn!(name = %name, error = %e, "docker log stream ended");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(lines.flatten().boxed())
    }
}
