//! `NodeRegistry` (spec §4): the active-node directory, grounded on
//! `node_manager.py`'s `get_active_nodes`, `get_primary_node` and
//! `get_node_client`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::BackendClient;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::node::{AdminStatus, Node, NodeId};

/// Produces the `BackendClient` capability for a given node.
///
/// Kept separate from `MetadataStore` the same way `backup/read_chunk.rs`
/// keeps chunk reading separate from the datastore that describes where
/// chunks live: a node's row is a fact, its client is a capability.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn client_for(&self, node: &Node) -> Result<Arc<dyn BackendClient>>;
}

/// `BackendFactory` over a fixed, pre-built map of clients, used by tests
/// and by any deployment where the node set is wired up ahead of time.
#[derive(Default)]
pub struct StaticBackendFactory {
    clients: Mutex<HashMap<NodeId, Arc<dyn BackendClient>>>,
}

impl StaticBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<NodeId>, client: Arc<dyn BackendClient>) {
        self.clients.lock().insert(node_id.into(), client);
    }
}

#[async_trait]
impl BackendFactory for StaticBackendFactory {
    async fn client_for(&self, node: &Node) -> Result<Arc<dyn BackendClient>> {
        self.clients
            .lock()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable(format!("no client registered for node {}", node.id)))
    }
}

pub struct NodeRegistry {
    metadata: Arc<dyn MetadataStore>,
    backends: Arc<dyn BackendFactory>,
}

impl NodeRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>, backends: Arc<dyn BackendFactory>) -> Self {
        Self { metadata, backends }
    }

    /// Nodes with `admin_status == Active`, in no particular order.
    pub async fn active_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.metadata.list_nodes().await.map_err(Error::from)?;
        Ok(nodes.into_iter().filter(|n| n.admin_status.is_active()).collect())
    }

    pub async fn all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.metadata.list_nodes().await.map_err(Error::from)?)
    }

    /// The node currently elected primary, if its row is still active.
    pub async fn primary_node(&self) -> Result<Option<Node>> {
        let nodes = self.active_nodes().await?;
        Ok(nodes.into_iter().find(|n| n.is_primary))
    }

    pub async fn get_node(&self, id: &str) -> Result<Node> {
        self.metadata.get_node(id).await.map_err(Error::from)
    }

    /// Whether `node` is presently reachable, per a live ping (spec §4
    /// `check_node_availability`). Does not consult or update cached stats;
    /// callers wanting the cached view go through [`crate::monitor::NodeMonitor`].
    pub async fn check_node_availability(&self, node: &Node) -> bool {
        match self.backends.client_for(node).await {
            Ok(client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn client_for(&self, node: &Node) -> Result<Arc<dyn BackendClient>> {
        self.backends.client_for(node).await
    }

    pub async fn set_admin_status(&self, node_id: &str, status: AdminStatus) -> Result<()> {
        let mut node = self.get_node(node_id).await?;
        node.admin_status = status;
        self.metadata.upsert_node(node).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::metadata::InMemoryMetadataStore;
    use chrono::Utc;

    fn sample_node(id: &str, active: bool) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("{id}.example.invalid"),
            credentials: "secret".into(),
            bucket: "bucket".into(),
            priority: 0,
            admin_status: if active { AdminStatus::Active } else { AdminStatus::Inactive },
            is_primary: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn registry_with(nodes: Vec<Node>) -> (NodeRegistry, Vec<Arc<MemoryBackend>>) {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let factory = Arc::new(StaticBackendFactory::new());
        let mut backends = Vec::new();
        for node in nodes {
            let backend = Arc::new(MemoryBackend::new());
            factory.register(node.id.clone(), backend.clone() as Arc<dyn BackendClient>);
            backends.push(backend);
            metadata.upsert_node(node).await.unwrap();
        }
        let registry = NodeRegistry::new(metadata, factory as Arc<dyn BackendFactory>);
        (registry, backends)
    }

    #[tokio::test]
    async fn active_nodes_excludes_inactive() {
        let (registry, _backends) = registry_with(vec![sample_node("a", true), sample_node("b", false)]).await;
        let active = registry.active_nodes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[tokio::test]
    async fn check_node_availability_reflects_backend_ping() {
        let (registry, backends) = registry_with(vec![sample_node("a", true)]).await;
        let node = registry.get_node("a").await.unwrap();
        assert!(registry.check_node_availability(&node).await);

        backends[0].set_reachable(false);
        assert!(!registry.check_node_availability(&node).await);
    }
}
