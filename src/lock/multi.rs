//! All-or-nothing lock across independent substrates.
//!
//! Optional mode for deployments that run several unreplicated substrate
//! nodes. The same resource name is locked on every node; if any node
//! refuses, the nodes already taken are released and acquisition fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::{DistributedLock, Lock};
use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

/// Lock held only when every member lock is held.
#[derive(Debug)]
pub struct MultiLock {
    name: String,
    members: Vec<DistributedLock>,
}

impl MultiLock {
    /// One member per substrate, all for `name`.
    pub fn new(stores: &[Arc<dyn KeyValueStore>], name: impl Into<String>) -> Result<Self> {
        if stores.is_empty() {
            return Err(Error::Config("multi-lock needs at least one store".to_string()));
        }
        let name = name.into();
        let members = stores
            .iter()
            .map(|store| DistributedLock::new(store.clone(), name.clone()))
            .collect();
        Ok(Self { name, members })
    }

    async fn rollback(&self, acquired: usize) {
        for member in self.members[..acquired].iter().rev() {
            if let Err(e) = member.release().await {
                warn!(lock = %member.key(), error = %e, "Failed to roll back partial multi-lock");
            }
        }
    }
}

#[async_trait]
impl Lock for MultiLock {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(lock = %self.name, members = self.members.len()))]
    async fn try_acquire(&self, ttl: Duration) -> Result<bool> {
        for (index, member) in self.members.iter().enumerate() {
            match member.try_acquire(ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    self.rollback(index).await;
                    return Ok(false);
                }
                Err(e) => {
                    self.rollback(index).await;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    async fn release(&self) -> Result<bool> {
        let mut released = true;
        let mut first_error = None;
        for member in &self.members {
            match member.release().await {
                Ok(deleted) => released &= deleted,
                Err(e) => {
                    released = false;
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKeyValueStore;

    fn nodes(n: usize) -> Vec<Arc<InMemoryKeyValueStore>> {
        (0..n).map(|_| Arc::new(InMemoryKeyValueStore::new())).collect()
    }

    fn as_ports(nodes: &[Arc<InMemoryKeyValueStore>]) -> Vec<Arc<dyn KeyValueStore>> {
        nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn KeyValueStore>)
            .collect()
    }

    #[tokio::test]
    async fn test_acquires_on_every_node() {
        let nodes = nodes(3);
        let lock = MultiLock::new(&as_ports(&nodes), "order").unwrap();

        assert!(lock.try_acquire(Duration::from_secs(5)).await.unwrap());
        assert!(nodes.iter().all(|n| n.contains("lock:order")));

        assert!(lock.release().await.unwrap());
        assert!(nodes.iter().all(|n| !n.contains("lock:order")));
    }

    #[tokio::test]
    async fn test_partial_acquisition_rolls_back() {
        let nodes = nodes(3);
        let ports = as_ports(&nodes);

        let squatter = DistributedLock::new(ports[2].clone(), "order");
        assert!(squatter.try_acquire(Duration::from_secs(5)).await.unwrap());

        let lock = MultiLock::new(&ports, "order").unwrap();
        assert!(!lock.try_acquire(Duration::from_secs(5)).await.unwrap());
        assert!(!nodes[0].contains("lock:order"));
        assert!(!nodes[1].contains("lock:order"));
        assert!(squatter.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_node_fault_rolls_back_and_errors() {
        let nodes = nodes(2);
        nodes[1].set_unavailable(true);
        let lock = MultiLock::new(&as_ports(&nodes), "order").unwrap();

        assert!(lock.try_acquire(Duration::from_secs(5)).await.is_err());
        assert!(!nodes[0].contains("lock:order"));
    }

    #[test]
    fn test_empty_store_list_rejected() {
        assert!(MultiLock::new(&[], "x").is_err());
    }
}
