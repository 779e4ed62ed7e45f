//! Access to NodeAllocationState objects in the cluster.
//!
//! [`AllocationStateStore`] is the only seam between the status protocol and
//! the API server, which keeps the protocol testable without a cluster. Every
//! write is conditional on the resourceVersion carried by the object passed
//! in: a mismatch surfaces as [`OperatorError::Conflict`].

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::NodeAllocationState;
use crate::error::{OperatorError, Result};

/// CRUD over NodeAllocationState objects in a single namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AllocationStateStore: Send + Sync {
    /// Fetch a record by name.
    async fn get(&self, name: &str) -> Result<NodeAllocationState>;

    /// Create a record. Status is dropped by the API server.
    async fn create(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState>;

    /// Write metadata and spec, conditional on `nas`'s resourceVersion.
    async fn replace(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState>;

    /// Write the status subresource, conditional on `nas`'s resourceVersion.
    async fn replace_status(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState>;
}

/// Store backed by the Kubernetes API.
pub struct KubeAllocationStateStore {
    api: Api<NodeAllocationState>,
}

impl KubeAllocationStateStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn require_resource_version(nas: &NodeAllocationState) -> Result<String> {
    nas.resource_version().ok_or_else(|| {
        OperatorError::InvalidState(format!(
            "NodeAllocationState {} has no resourceVersion; refusing an unconditional write",
            nas.name_any()
        ))
    })
}

#[async_trait]
impl AllocationStateStore for KubeAllocationStateStore {
    async fn get(&self, name: &str) -> Result<NodeAllocationState> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState> {
        let created = self.api.create(&PostParams::default(), nas).await?;
        debug!(name = %created.name_any(), "Created NodeAllocationState");
        Ok(created)
    }

    async fn replace(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState> {
        require_resource_version(nas)?;
        Ok(self
            .api
            .replace(&nas.name_any(), &PostParams::default(), nas)
            .await?)
    }

    async fn replace_status(&self, nas: &NodeAllocationState) -> Result<NodeAllocationState> {
        // A merge patch that carries metadata.resourceVersion is rejected with
        // 409 when the stored version differs.
        let resource_version = require_resource_version(nas)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": nas.status,
        });
        Ok(self
            .api
            .patch_status(&nas.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}


#[cfg(test)]
mod tests {
    use super::memory::InMemoryStore;
    use super::*;
    use crate::crd::{node_owner_reference, NodeAllocationStateConfig, NodeAllocationStateStatus};

    fn identity() -> NodeAllocationStateConfig {
        NodeAllocationStateConfig {
            name: "worker-1".to_string(),
            namespace: "default".to_string(),
            owner: node_owner_reference("worker-1", "uid-1"),
        }
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_writes() {
        let store = InMemoryStore::new();
        let created = store.create(&identity().new_record()).await.unwrap();

        let mut first = created.clone();
        first.status = Some(NodeAllocationStateStatus::Ready);
        store.replace_status(&first).await.unwrap();

        let mut second = created;
        second.status = Some(NodeAllocationStateStatus::NotReady);
        let err = store.replace_status(&second).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.stored("worker-1").unwrap();
        assert_eq!(stored.status, Some(NodeAllocationStateStatus::Ready));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_create_drops_status_and_detects_duplicates() {
        let store = InMemoryStore::new();
        let mut nas = identity().new_record();
        nas.status = Some(NodeAllocationStateStatus::Ready);

        let created = store.create(&nas).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.resource_version().is_some());

        let err = store.create(&nas).await.unwrap_err();
        assert!(matches!(err, OperatorError::AlreadyExists(_)));
    }

    #[test]
    fn test_unversioned_writes_are_refused() {
        let nas = identity().new_record();
        let err = require_resource_version(&nas).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidState(_)));
    }
}
