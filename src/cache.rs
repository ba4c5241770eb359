use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::plug::client::PlugClient;
use crate::plug::{self, SystemInfo};

/// Latest known state of every plug that has answered at least once, plus
/// the client that reaches it.
///
/// One lock covers every device. Entries are never removed; an unreachable
/// plug keeps serving its last snapshot. A snapshot read on a link is never
/// replaced by an older reply from that same link.
#[derive(Clone, Default)]
pub struct TelemetryCache {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    snapshots: BTreeMap<String, SystemInfo>,
    routes: HashMap<String, Route>,
}

struct Route {
    client: Arc<PlugClient>,
    seq: u64,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query `client` for system info and replace its cache entry. The lock
    /// is only taken once the reply has been decoded.
    pub async fn refresh(&self, client: &Arc<PlugClient>) -> plug::Result<SystemInfo> {
        let (seq, info) = client.system_info().await?;
        self.store(client, seq, info.clone()).await;
        Ok(info)
    }

    /// Record `info` as the latest snapshot for its device and register
    /// `client` as the route to it. `seq` is the link sequence number of the
    /// reply; a store older than the current entry from the same client is
    /// dropped and `false` returned.
    pub async fn store(&self, client: &Arc<PlugClient>, seq: u64, info: SystemInfo) -> bool {
        let id = info.device_id().to_string();
        let mut inner = self.inner.write().await;
        if let Some(route) = inner.routes.get(&id) {
            if Arc::ptr_eq(&route.client, client) && route.seq > seq {
                debug!("Dropping stale snapshot #{} of {} (have #{})", seq, id, route.seq);
                return false;
            }
        }
        inner.routes.insert(
            id.clone(),
            Route {
                client: Arc::clone(client),
                seq,
            },
        );
        inner.snapshots.insert(id, info);
        true
    }

    #[cfg(test)]
    pub async fn get(&self, device_id: &str) -> Option<SystemInfo> {
        self.inner.read().await.snapshots.get(device_id).cloned()
    }

    /// Snapshot and client for a device, read under one lock acquisition.
    pub async fn entry(&self, device_id: &str) -> Option<(SystemInfo, Arc<PlugClient>)> {
        let inner = self.inner.read().await;
        let info = inner.snapshots.get(device_id)?.clone();
        let client = Arc::clone(&inner.routes.get(device_id)?.client);
        Some((info, client))
    }

    pub async fn client(&self, device_id: &str) -> Option<Arc<PlugClient>> {
        let inner = self.inner.read().await;
        inner.routes.get(device_id).map(|route| Arc::clone(&route.client))
    }

    #[cfg(test)]
    pub async fn device_ids(&self) -> Vec<String> {
        self.inner.read().await.snapshots.keys().cloned().collect()
    }

    /// The viewer frame: a JSON object of device id to system info.
    pub async fn to_json(&self) -> serde_json::Result<String> {
        let inner = self.inner.read().await;
        serde_json::to_string(&inner.snapshots)
    }
}
