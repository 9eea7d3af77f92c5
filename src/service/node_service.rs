// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Result;
use crate::node::{NodeApi, NodeConnector};
use crate::repo::{Error as RepoError, Repo};
use crate::types::Node;

const REFRESH_INTERVAL: Duration = Duration::from_secs(20);

/// Secondary node endpoints registered by operators. The engine runs against
/// its primary handle; this keeps the spares dialed and in sync with the
/// store.
pub struct NodeService {
    repo: Arc<dyn Repo>,
    connector: Arc<dyn NodeConnector>,
    clients: RwLock<HashMap<String, Arc<dyn NodeApi>>>,
}

impl NodeService {
    pub fn new(repo: Arc<dyn Repo>, connector: Arc<dyn NodeConnector>) -> Self {
        NodeService {
            repo,
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn check_node(&self, node: &Node) -> Result<()> {
        for existing in self.repo.node_repo().list_node()? {
            if existing.name == node.name {
                return Err(RepoError::already_exists(format!("node {}", node.name)).into());
            }
            if existing.url == node.url && existing.token == node.token {
                return Err(
                    RepoError::already_exists(format!("node with url {}", node.url)).into(),
                );
            }
        }
        Ok(())
    }

    pub async fn save_node(&self, node: &Node) -> Result<()> {
        self.check_node(node)?;
        let client = self.connector.connect(node).await?;
        self.repo.node_repo().save_node(node)?;
        self.clients.write().insert(node.name.clone(), client);
        info!(node = %node.name, "node saved");
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Result<Node> {
        Ok(self.repo.node_repo().get_node(name)?)
    }

    pub fn has_node(&self, name: &str) -> Result<bool> {
        Ok(self.repo.node_repo().has_node(name)?)
    }

    pub fn list_node(&self) -> Result<Vec<Node>> {
        Ok(self.repo.node_repo().list_node()?)
    }

    pub fn delete_node(&self, name: &str) -> Result<()> {
        self.repo.node_repo().del_node(name)?;
        self.clients.write().remove(name);
        info!(node = %name, "node deleted");
        Ok(())
    }

    pub fn client(&self, name: &str) -> Option<Arc<dyn NodeApi>> {
        self.clients.read().get(name).cloned()
    }

    /// Reconcile dialed clients with stored records until shutdown.
    pub fn start_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("node refresh failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn refresh(&self) -> Result<()> {
        let nodes = self.repo.node_repo().list_node()?;
        let mut stale: Vec<String> = self.clients.read().keys().cloned().collect();
        for node in nodes {
            stale.retain(|name| name != &node.name);
            if self.clients.read().contains_key(&node.name) {
                continue;
            }
            match self.connector.connect(&node).await {
                Ok(client) => {
                    self.clients.write().insert(node.name.clone(), client);
                    info!(node = %node.name, "node connected");
                }
                Err(e) => warn!(node = %node.name, "node connect failed: {e}"),
            }
        }
        // records deleted out-of-band lose their clients
        for name in stale {
            self.clients.write().remove(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_api::TestNode;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct TestNodeConnector;

    #[async_trait]
    impl NodeConnector for TestNodeConnector {
        async fn connect(&self, _node: &Node) -> crate::node::Result<Arc<dyn NodeApi>> {
            Ok(Arc::new(TestNode::new()))
        }
    }

    fn node(name: &str, url: &str) -> Node {
        let now = Utc::now();
        Node {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            token: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_rejects_duplicates_and_dials() {
        let repo = Arc::new(crate::repo::memory::MemRepo::new());
        let svc = NodeService::new(repo, Arc::new(TestNodeConnector));

        svc.save_node(&node("n1", "ws://a")).await.unwrap();
        assert!(svc.client("n1").is_some());
        assert!(svc.save_node(&node("n1", "ws://b")).await.is_err());
        assert!(svc.save_node(&node("n2", "ws://a")).await.is_err());

        svc.delete_node("n1").unwrap();
        assert!(svc.client("n1").is_none());
        assert!(!svc.has_node("n1").unwrap());
    }

    #[tokio::test]
    async fn refresh_tracks_store() {
        let repo = Arc::new(crate::repo::memory::MemRepo::new());
        let svc = NodeService::new(repo.clone(), Arc::new(TestNodeConnector));

        use crate::repo::NodeRepo;
        repo.save_node(&node("n1", "ws://a")).unwrap();
        svc.refresh().await.unwrap();
        assert!(svc.client("n1").is_some());

        repo.del_node("n1").unwrap();
        svc.refresh().await.unwrap();
        assert!(svc.client("n1").is_none());
    }
}
