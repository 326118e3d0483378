//! Service status
//!
//! Version/build info, provider health and quota-scan tracking exposed
//! through the status endpoints.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub features: Vec<&'static str>,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: VERSION,
        features: vec!["kms", "defender", "eventrules"],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesStatus {
    pub data_provider: ProviderStatus,
    pub defender: DefenderStatus,
    pub connections: usize,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub is_active: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefenderStatus {
    pub is_active: bool,
}

/// Tracks in-flight quota scans: at most one per user.
#[derive(Default)]
pub struct QuotaScanTracker {
    active: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveScan {
    pub username: String,
}

impl QuotaScanTracker {
    /// Claim a scan slot; false when one is already running.
    pub fn start(&self, username: &str) -> bool {
        self.active.lock().unwrap().insert(username.to_string())
    }

    pub fn finish(&self, username: &str) {
        self.active.lock().unwrap().remove(username);
    }

    pub fn list(&self) -> Vec<ActiveScan> {
        let mut scans: Vec<ActiveScan> = self
            .active
            .lock()
            .unwrap()
            .iter()
            .map(|username| ActiveScan {
                username: username.clone(),
            })
            .collect();
        scans.sort_by(|a, b| a.username.cmp(&b.username));
        scans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_scan_per_user() {
        let tracker = QuotaScanTracker::default();
        assert!(tracker.start("alice"));
        assert!(!tracker.start("alice"));
        assert!(tracker.start("bob"));
        tracker.finish("alice");
        assert!(tracker.start("alice"));
        assert_eq!(tracker.list().len(), 2);
    }
}
