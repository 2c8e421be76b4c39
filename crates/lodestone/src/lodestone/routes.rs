//! Concurrent hostname -> backend endpoint table with an optional default.
//!
//! Mutations come from startup flags, the admin API and the control-plane
//! feed; resolves happen once per accepted connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct RouteTable {
    mappings: DashMap<String, String>,
    default_route: ArcSwapOption<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive exact lookup on the sanitized hostname, falling back
    /// to the default route. The port the client advertised plays no part.
    pub fn resolve(&self, host: &str) -> Option<String> {
        let key = sanitize_host(host);
        if !key.is_empty() {
            if let Some(endpoint) = self.mappings.get(&key) {
                return Some(endpoint.clone());
            }
        }
        self.default_route.load_full().map(|ep| (*ep).clone())
    }

    pub fn create_mapping(&self, host: &str, endpoint: &str) {
        let key = sanitize_host(host);
        let endpoint = endpoint.trim();
        if key.is_empty() || endpoint.is_empty() {
            return;
        }
        self.mappings.insert(key, endpoint.to_string());
    }

    pub fn delete_mapping(&self, host: &str) -> bool {
        self.mappings.remove(&sanitize_host(host)).is_some()
    }

    /// Sets the fallback endpoint; an empty endpoint clears it.
    pub fn set_default_route(&self, endpoint: &str) {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            self.default_route.store(None);
        } else {
            self.default_route
                .store(Some(Arc::new(endpoint.to_string())));
        }
    }

    pub fn default_route(&self) -> Option<String> {
        self.default_route.load_full().map(|ep| (*ep).clone())
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        let mut mappings = BTreeMap::new();
        for entry in self.mappings.iter() {
            mappings.insert(entry.key().clone(), entry.value().clone());
        }
        RouteSnapshot {
            mappings,
            default_route: self.default_route(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    pub mappings: BTreeMap<String, String>,
    pub default_route: Option<String>,
}

/// Folds a handshake server address into its routing key: lowercased,
/// trimmed, trailing dot removed, and cut at the first NUL so Forge clients
/// (`host\0FML\0...`) route by the bare hostname.
pub fn sanitize_host(host: &str) -> String {
    let host = host.split('\0').next().unwrap_or("");
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
