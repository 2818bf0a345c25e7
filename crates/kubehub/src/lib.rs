//! Lookout kubehub: Kubernetes pods as a resource source.
//!
//! Each configured service maps to one resource: the container named after
//! the service, in a running and ready pod labelled `app=<service>`. The pod
//! backing a service stays put while it qualifies (see [`PodTracker`]).

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::{
    api::{Api, ListParams, LogParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use lookout_core::{ChangeStream, LogStream, Property, ResourceSnapshot, ResourceType, SourceAdapter, Url, WatchChange};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod pump;
mod tracker;

pub use pump::pump_lines;
pub use tracker::PodTracker;

type Timestamp = Option<chrono::DateTime<chrono::Utc>>;

/// Which pods to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeConfig {
    pub namespace: String,
    pub services: Vec<String>,
}

impl KubeConfig {
    /// `services` is a `;`-separated list of service names.
    pub fn new(namespace: impl Into<String>, services: &str) -> Result<Self> {
        let services: Vec<String> =
            services.split(';').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        if services.is_empty() {
            bail!("no service names provided");
        }
        Ok(Self { namespace: namespace.into(), services })
    }
}

/// Container selected for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeContainer {
    pub name: String,
    pub pod: String,
    pub container_id: String,
    pub image: String,
    pub port: i32,
    pub ready: bool,
    pub restart_count: i32,
    pub state: &'static str,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub exit_code: Option<i32>,
}

impl KubeContainer {
    pub fn to_snapshot(&self) -> ResourceSnapshot {
        let mut s = ResourceSnapshot::new(&self.name).with_type(ResourceType::PodContainer);
        if !self.state.is_empty() {
            s.state = Some(self.state.to_string());
        }
        s.uid = self.container_id.clone();
        s.creation_time = self.started_at;
        s.start_time = self.started_at;
        s.stop_time = self.finished_at;
        s.exit_code = self.exit_code;
        let endpoint = format!("http://{}:{}", self.name, self.port);
        s.urls.push(Url::external(endpoint.clone(), endpoint));
        s.properties = vec![
            Property::new("container.id", self.container_id.clone()),
            Property::new("container.image", self.image.clone()),
            Property::new("container.ports", self.port),
            Property::new("pod.name", self.pod.clone()),
            Property::new("pod.restartCount", self.restart_count),
            Property::new("pod.ready", self.ready),
        ];
        s
    }
}

pub(crate) fn has_app_label(pod: &Pod, service: &str) -> bool {
    pod.metadata.labels.as_ref().and_then(|l| l.get("app")).map(|v| v == service).unwrap_or(false)
}

fn is_running_and_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else { return false };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false)
}

/// Later states win: a container that is both terminated and waiting to
/// restart reports "Waiting".
fn container_state(status: &ContainerStatus) -> (&'static str, Timestamp, Timestamp, Option<i32>) {
    let mut label = "";
    let (mut started, mut finished, mut exit_code) = (None, None, None);
    if let Some(state) = status.state.as_ref() {
        if let Some(running) = state.running.as_ref() {
            label = "Running";
            started = running.started_at.as_ref().map(|t| t.0);
        }
        if let Some(terminated) = state.terminated.as_ref() {
            label = "Terminated";
            started = started.or_else(|| terminated.started_at.as_ref().map(|t| t.0));
            finished = terminated.finished_at.as_ref().map(|t| t.0);
            exit_code = Some(terminated.exit_code);
        }
        if state.waiting.is_some() {
            label = "Waiting";
        }
    }
    (label, started, finished, exit_code)
}

/// The container backing `service` in `pod`, if the pod qualifies.
pub fn container_for_service(pod: &Pod, service: &str) -> Option<KubeContainer> {
    if !has_app_label(pod, service) || !is_running_and_ready(pod) {
        return None;
    }
    container_in_pod(pod, service)
}

/// The container named `service` in `pod`, whatever the pod's condition.
pub(crate) fn container_in_pod(pod: &Pod, service: &str) -> Option<KubeContainer> {
    let status = pod.status.as_ref()?.container_statuses.as_ref()?.iter().find(|c| c.name == service)?;
    let spec = pod.spec.as_ref()?.containers.iter().find(|c| c.name == service)?;
    let port = spec.ports.as_ref().and_then(|ps| ps.first()).map(|p| p.container_port).unwrap_or(0);
    let (state, started_at, finished_at, exit_code) = container_state(status);
    Some(KubeContainer {
        name: status.name.clone(),
        pod: pod.metadata.name.clone().unwrap_or_default(),
        container_id: status.container_id.clone().unwrap_or_default(),
        image: status.image.clone(),
        port,
        ready: status.ready,
        restart_count: status.restart_count,
        state,
        started_at,
        finished_at,
        exit_code,
    })
}

pub struct KubeAdapter {
    pods: Api<Pod>,
    cfg: KubeConfig,
    tracker: Arc<Mutex<PodTracker>>,
}

impl KubeAdapter {
    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn connect(cfg: KubeConfig) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: KubeConfig) -> Self {
        let pods = Api::namespaced(client, &cfg.namespace);
        let tracker = Arc::new(Mutex::new(PodTracker::new(cfg.services.clone().into())));
        Self { pods, cfg, tracker }
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let list = self
            .pods
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing pods in namespace {}", self.cfg.namespace))?;
        Ok(list.items)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for KubeAdapter {
    fn kind(&self) -> &str {
        "kubernetes"
    }

    fn default_resource_type(&self) -> ResourceType {
        ResourceType::PodContainer
    }

    async fn list_initial(&self) -> Result<Vec<ResourceSnapshot>> {
        let pods = self.list_pods().await?;
        let total = pods.len();
        let snapshots: Vec<ResourceSnapshot> =
            self.tracker.lock().reset(pods).into_iter().filter_map(|change| change.upsert).collect();
        info!(ns = %self.cfg.namespace, pods = total, containers = snapshots.len(), "kubernetes resources listed");
        Ok(snapshots)
    }

    async fn watch(&self) -> Result<ChangeStream> {
        let tracker = Arc::clone(&self.tracker);
        let ns = self.cfg.namespace.clone();
        let events = watcher::watcher(self.pods.clone(), watcher::Config::default()).default_backoff();
        info!(ns = %ns, "pod watcher started");
        let changes = events
            .filter_map(move |ev| {
                let tracker = Arc::clone(&tracker);
                let ns = ns.clone();
                async move {
                    match ev {
                        Ok(ev) => {
                            let changes = tracker.lock().on_event(ev);
                            Some(stream::iter(changes.into_iter().map(Ok::<_, anyhow::Error>)))
                        }
                        Err(e) => {
                            // The watcher backs off and resumes on its own.
                            warn!(ns = %ns, error = %e, "pod watch error");
                            metrics::counter!("lookout_kube_watch_errors_total", 1u64);
                            None
                        }
                    }
                }
            })
            .flatten();
        Ok(changes.boxed())
    }

    async fn stream_logs(&self, resource_name: &str) -> Result<LogStream> {
        let pods = self.list_pods().await?;
        let backing = self.tracker.lock().backing_pod(resource_name).map(str::to_string);
        let container = pods
            .iter()
            .filter(|p| backing.is_none() || p.metadata.name == backing)
            .find_map(|p| container_for_service(p, resource_name))
            .or_else(|| pods.iter().find_map(|p| container_for_service(p, resource_name)))
            .ok_or_else(|| anyhow!("no ready pod found for {}", resource_name))?;

        let lp = LogParams { follow: true, container: Some(container.name.clone()), ..LogParams::default() };
        let reader = self
            .pods
            .log_stream(&container.pod, &lp)
            .await
            .with_context(|| format!("opening log stream for pod {}", container.pod))?;
        debug!(pod = %container.pod, container = %container.name, "log stream opened");

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            let bytes = ReaderStream::new(reader.compat());
            pump_lines(bytes, tx, Some(&container.pod)).await;
        });
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher::Event;

    fn pod(name: &str, app: &str, phase: &str, ready: &str, container_state: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "labels": { "app": app } },
            "spec": { "containers": [ { "name": app, "ports": [ { "containerPort": 8080 } ] } ] },
            "status": {
                "phase": phase,
                "conditions": [ { "type": "Ready", "status": ready } ],
                "containerStatuses": [ {
                    "name": app,
                    "containerID": format!("containerd://{name}"),
                    "image": "registry/app:1",
                    "imageID": "",
                    "ready": ready == "True",
                    "restartCount": 2,
                    "state": container_state
                } ]
            }
        }))
        .unwrap()
    }

    fn running() -> serde_json::Value {
        serde_json::json!({ "running": { "startedAt": "2024-05-01T10:00:00Z" } })
    }

    #[test]
    fn config_splits_service_names() {
        let cfg = KubeConfig::new("apps", "web; api;;").unwrap();
        assert_eq!(cfg.services, vec!["web", "api"]);
        assert!(KubeConfig::new("apps", " ; ").is_err());
    }

    #[test]
    fn ready_running_pod_maps_to_snapshot() {
        let p = pod("web-7d9", "web", "Running", "True", running());
        let c = container_for_service(&p, "web").unwrap();
        assert_eq!(c.state, "Running");
        assert_eq!(c.port, 8080);
        assert_eq!(c.pod, "web-7d9");

        let s = c.to_snapshot();
        assert_eq!(s.name, "web");
        assert_eq!(s.resource_type, ResourceType::PodContainer);
        assert_eq!(s.uid, "containerd://web-7d9");
        assert_eq!(s.urls[0].full_url, "http://web:8080");
        assert_eq!(s.start_time.map(|t| t.to_rfc3339()), Some("2024-05-01T10:00:00+00:00".to_string()));
        assert!(s.properties.iter().any(|p| p.name == "container.image" && p.value == "registry/app:1"));
    }

    #[test]
    fn unready_or_unlabelled_pods_are_skipped() {
        assert!(container_for_service(&pod("w", "web", "Running", "False", running()), "web").is_none());
        assert!(container_for_service(&pod("w", "web", "Pending", "True", running()), "web").is_none());
        assert!(container_for_service(&pod("w", "web", "Running", "True", running()), "api").is_none());
    }

    #[test]
    fn terminated_container_reports_exit_code() {
        let state = serde_json::json!({ "terminated": {
            "exitCode": 137, "startedAt": "2024-05-01T10:00:00Z", "finishedAt": "2024-05-01T11:00:00Z"
        } });
        let c = container_for_service(&pod("w", "web", "Running", "True", state), "web").unwrap();
        assert_eq!(c.state, "Terminated");
        assert_eq!(c.exit_code, Some(137));
        assert!(c.finished_at.is_some());
    }

    fn tracker(services: &[&str]) -> PodTracker {
        PodTracker::new(services.iter().map(|s| s.to_string()).collect())
    }

    fn pod_of(change: &WatchChange) -> Option<&str> {
        let s = change.upsert.as_ref()?;
        s.properties.iter().find(|p| p.name == "pod.name").and_then(|p| p.value.as_str())
    }

    #[test]
    fn first_qualifying_pod_wins_per_service() {
        let mut t = tracker(&["web", "api", "db"]);
        let changes = t.reset(vec![
            pod("web-old", "web", "Running", "False", running()),
            pod("web-new", "web", "Running", "True", running()),
            pod("api-1", "api", "Running", "True", running()),
        ]);
        let pods: Vec<_> = changes.iter().filter_map(pod_of).collect();
        assert_eq!(pods, vec!["web-new", "api-1"]);
        assert_eq!(t.backing_pod("web"), Some("web-new"));
        assert_eq!(t.backing_pod("db"), None);
    }

    #[test]
    fn watcher_events_map_to_changes() {
        let mut t = tracker(&["web"]);
        let p = pod("web-1", "web", "Running", "True", running());

        let applied = t.on_event(Event::Applied(p.clone()));
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].upsert.as_ref().map(|s| s.name.as_str()), Some("web"));

        let other = pod("api-1", "api", "Running", "True", running());
        assert!(t.on_event(Event::Applied(other)).is_empty());
        assert_eq!(t.on_event(Event::Restarted(vec![p.clone()])).len(), 1);

        let deleted = t.on_event(Event::Deleted(p));
        assert_eq!(deleted, vec![WatchChange::delete("web")]);
        assert_eq!(t.backing_pod("web"), None);
    }

    #[test]
    fn rollout_keeps_service_while_a_replica_serves() {
        let mut t = tracker(&["web"]);
        let new = t.on_event(Event::Applied(pod("web-new", "web", "Running", "True", running())));
        assert_eq!(new.iter().filter_map(pod_of).collect::<Vec<_>>(), vec!["web-new"]);

        let old = pod("web-old", "web", "Running", "False", running());
        assert!(t.on_event(Event::Applied(old.clone())).is_empty());
        assert!(t.on_event(Event::Deleted(old)).is_empty());
        assert_eq!(t.backing_pod("web"), Some("web-new"));
    }

    #[test]
    fn deleted_backing_pod_hands_over_to_replica() {
        let mut t = tracker(&["web"]);
        let a = pod("web-a", "web", "Running", "True", running());
        let b = pod("web-b", "web", "Running", "True", running());
        t.on_event(Event::Applied(a.clone()));
        // web-a already serves, so web-b is only remembered.
        assert!(t.on_event(Event::Applied(b.clone())).is_empty());

        let moved = t.on_event(Event::Deleted(a));
        assert_eq!(moved.iter().filter_map(pod_of).collect::<Vec<_>>(), vec!["web-b"]);
        assert_eq!(t.backing_pod("web"), Some("web-b"));

        assert_eq!(t.on_event(Event::Deleted(b)), vec![WatchChange::delete("web")]);
    }

    #[test]
    fn backing_pod_losing_readiness_reports_its_state() {
        let mut t = tracker(&["web"]);
        t.on_event(Event::Applied(pod("web-1", "web", "Running", "True", running())));

        let unready = t.on_event(Event::Applied(pod("web-1", "web", "Running", "False", running())));
        assert_eq!(unready.len(), 1);
        let s = unready[0].upsert.as_ref().unwrap();
        assert_eq!(s.name, "web");
        assert_eq!(s.state.as_deref(), Some("NotReady"));

        let state = serde_json::json!({ "terminated": { "exitCode": 1 } });
        let failed = t.on_event(Event::Applied(pod("web-1", "web", "Failed", "False", state)));
        assert_eq!(failed[0].upsert.as_ref().and_then(|s| s.state.as_deref()), Some("Terminated"));
        assert_eq!(t.backing_pod("web"), Some("web-1"));

        let back = t.on_event(Event::Applied(pod("web-1", "web", "Running", "True", running())));
        assert_eq!(back[0].upsert.as_ref().and_then(|s| s.state.as_deref()), Some("Running"));
    }

    #[test]
    fn unready_backing_pod_yields_to_ready_replica() {
        let mut t = tracker(&["web"]);
        t.on_event(Event::Applied(pod("web-a", "web", "Running", "True", running())));
        t.on_event(Event::Applied(pod("web-b", "web", "Running", "True", running())));

        let moved = t.on_event(Event::Applied(pod("web-a", "web", "Running", "False", running())));
        assert_eq!(moved.iter().filter_map(pod_of).collect::<Vec<_>>(), vec!["web-b"]);
        assert_eq!(t.backing_pod("web"), Some("web-b"));
    }

    #[test]
    fn relist_deletes_services_whose_pods_vanished() {
        let mut t = tracker(&["web", "api"]);
        t.reset(vec![
            pod("web-1", "web", "Running", "True", running()),
            pod("api-1", "api", "Running", "True", running()),
        ]);

        let changes = t.on_event(Event::Restarted(vec![pod("web-1", "web", "Pending", "False", running())]));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].upsert.as_ref().and_then(|s| s.state.as_deref()), Some("Pending"));
        assert_eq!(changes[1], WatchChange::delete("api"));
    }
}
