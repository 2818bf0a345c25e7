use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Event;
use lookout_core::{ResourceSnapshot, ResourceType, WatchChange};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{container_for_service, container_in_pod, has_app_label};

/// Which pod currently backs each service.
///
/// A service keeps its backing pod while that pod qualifies. When it stops
/// qualifying or goes away, another qualifying replica takes over; the
/// service is only deleted once no pod is left to back it.
pub struct PodTracker {
    services: Arc<[String]>,
    /// Pods labelled for a configured service, by name.
    pods: BTreeMap<String, Pod>,
    backing: FxHashMap<String, String>,
}

fn pod_name(pod: &Pod) -> Option<&str> {
    pod.metadata.name.as_deref().filter(|n| !n.is_empty())
}

/// Snapshot for a backing pod that no longer serves: keeps the container
/// details but reports why it is out.
fn not_serving(pod: &Pod, service: &str) -> ResourceSnapshot {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
    match container_in_pod(pod, service) {
        Some(c) => {
            let mut s = c.to_snapshot();
            if c.state.is_empty() || c.state == "Running" {
                s.state = Some(if phase == "Running" { "NotReady".to_string() } else { phase.to_string() });
            }
            s
        }
        None => ResourceSnapshot::new(service).with_type(ResourceType::PodContainer).with_state(phase),
    }
}

impl PodTracker {
    pub fn new(services: Arc<[String]>) -> Self {
        Self { services, pods: BTreeMap::new(), backing: FxHashMap::default() }
    }

    pub fn backing_pod(&self, service: &str) -> Option<&str> {
        self.backing.get(service).map(String::as_str)
    }

    fn is_labelled(&self, pod: &Pod) -> bool {
        self.services.iter().any(|svc| has_app_label(pod, svc))
    }

    fn qualifying(&self, service: &str, except: Option<&str>) -> Option<(String, WatchChange)> {
        self.pods
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .find_map(|(name, pod)| container_for_service(pod, service).map(|c| (name.clone(), WatchChange::upsert(c.to_snapshot()))))
    }

    /// Hand `service` to another replica, or report it gone.
    fn fail_over(&mut self, service: &str, from: &str) -> WatchChange {
        match self.qualifying(service, Some(from)) {
            Some((pod, change)) => {
                debug!(service = %service, from = %from, to = %pod, "service moved to another pod");
                self.backing.insert(service.to_string(), pod);
                change
            }
            None => {
                debug!(service = %service, pod = %from, "last pod for service went away");
                self.backing.remove(service);
                WatchChange::delete(service)
            }
        }
    }

    /// Changes implied by one watcher event.
    pub fn on_event(&mut self, ev: Event<Pod>) -> Vec<WatchChange> {
        match ev {
            Event::Applied(pod) => self.apply(pod),
            Event::Deleted(pod) => self.delete(&pod),
            Event::Restarted(pods) => self.reset(pods),
        }
    }

    pub fn apply(&mut self, pod: Pod) -> Vec<WatchChange> {
        let Some(name) = pod_name(&pod).map(str::to_string) else { return Vec::new() };
        if !self.is_labelled(&pod) {
            // Relabelled away from every service.
            return if self.pods.contains_key(&name) { self.delete(&pod) } else { Vec::new() };
        }
        self.pods.insert(name.clone(), pod.clone());

        let mut out = Vec::new();
        for svc in self.services.clone().iter() {
            let backing = self.backing.get(svc).cloned();
            let is_backing = backing.as_deref() == Some(name.as_str());
            if !has_app_label(&pod, svc) {
                if is_backing {
                    out.push(self.fail_over(svc, &name));
                }
                continue;
            }
            match container_for_service(&pod, svc) {
                Some(c) => {
                    let taken = backing
                        .as_deref()
                        .filter(|b| *b != name)
                        .and_then(|b| self.pods.get(b))
                        .is_some_and(|b| container_for_service(b, svc).is_some());
                    if !taken {
                        self.backing.insert(svc.clone(), name.clone());
                        out.push(WatchChange::upsert(c.to_snapshot()));
                    }
                }
                None if is_backing => match self.qualifying(svc, Some(&name)) {
                    Some((other, change)) => {
                        self.backing.insert(svc.clone(), other);
                        out.push(change);
                    }
                    None => out.push(WatchChange::upsert(not_serving(&pod, svc))),
                },
                None => {}
            }
        }
        out
    }

    pub fn delete(&mut self, pod: &Pod) -> Vec<WatchChange> {
        let Some(name) = pod_name(pod) else { return Vec::new() };
        self.pods.remove(name);
        let orphaned: Vec<String> =
            self.backing.iter().filter(|(_, b)| b.as_str() == name).map(|(svc, _)| svc.clone()).collect();
        orphaned.iter().map(|svc| self.fail_over(svc, name)).collect()
    }

    /// Replace everything known with a full listing.
    pub fn reset(&mut self, pods: Vec<Pod>) -> Vec<WatchChange> {
        self.pods = pods
            .into_iter()
            .filter(|p| self.is_labelled(p))
            .filter_map(|p| {
                let name = pod_name(&p)?.to_string();
                Some((name, p))
            })
            .collect();

        let mut out = Vec::new();
        for svc in self.services.clone().iter() {
            let previous = self.backing.get(svc).cloned();
            let kept = previous
                .as_deref()
                .and_then(|b| self.pods.get(b))
                .and_then(|p| container_for_service(p, svc))
                .map(|c| WatchChange::upsert(c.to_snapshot()));
            if let Some(change) = kept {
                out.push(change);
                continue;
            }
            if let Some((pod, change)) = self.qualifying(svc, None) {
                self.backing.insert(svc.clone(), pod);
                out.push(change);
                continue;
            }
            match previous.as_deref().and_then(|b| self.pods.get(b)) {
                Some(pod) if has_app_label(pod, svc) => out.push(WatchChange::upsert(not_serving(pod, svc))),
                _ => {
                    if self.backing.remove(svc).is_some() {
                        out.push(WatchChange::delete(svc.clone()));
                    }
                }
            }
        }
        out
    }
}
