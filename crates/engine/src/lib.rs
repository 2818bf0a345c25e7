//! Lookout engine: merges source change streams into a versioned store and
//! serves race-free subscriptions and routed log requests.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::warn;

mod engine;
pub mod mux;
pub mod routes;
pub mod subscription;

pub use engine::NotificationEngine;
pub use routes::{RoutingMap, SourceId};
pub use subscription::{ChangeFeed, Subscription, VersionGate};

/// Runtime knobs for the engine and the dashboard façade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Queued changes at which a subscriber is reported as slow.
    pub backlog_warn: usize,
    /// Max changes per dashboard "changes" message.
    pub batch_max: usize,
    /// Max log lines per dashboard log message.
    pub log_batch_max: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { backlog_warn: lookout_store::DEFAULT_BACKLOG_WARN, batch_max: 256, log_batch_max: 512 }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LOOKOUT_BACKLOG_WARN`, `LOOKOUT_BATCH_MAX` and
    /// `LOOKOUT_LOG_BATCH_MAX`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let read = |key: &str, default: usize| match get(key) {
            Some(raw) => match raw.parse::<usize>() {
                Ok(v) if v > 0 => v,
                _ => {
                    warn!(key, value = %raw, "ignoring invalid setting");
                    default
                }
            },
            None => default,
        };
        Self {
            backlog_warn: read("LOOKOUT_BACKLOG_WARN", d.backlog_warn),
            batch_max: read("LOOKOUT_BATCH_MAX", d.batch_max),
            log_batch_max: read("LOOKOUT_LOG_BATCH_MAX", d.log_batch_max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let cfg = EngineConfig::from_lookup(|k| match k {
            "LOOKOUT_BATCH_MAX" => Some("32".into()),
            "LOOKOUT_BACKLOG_WARN" => Some("lots".into()),
            "LOOKOUT_LOG_BATCH_MAX" => Some("0".into()),
            _ => None,
        });
        assert_eq!(cfg.batch_max, 32);
        assert_eq!(cfg.backlog_warn, EngineConfig::default().backlog_warn);
        assert_eq!(cfg.log_batch_max, EngineConfig::default().log_batch_max);
    }
}
