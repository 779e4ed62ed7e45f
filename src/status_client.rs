//! Typed accessor for a node's NodeAllocationState.
//!
//! [`StatusClient`] resolves the record for one node identity and applies
//! conditional writes to it. It never retries on its own: a rejected write
//! returns [`OperatorError::Conflict`] and the caller re-runs the whole
//! get-modify-write cycle through [`crate::retry::retry_on_conflict`], which
//! guarantees the retry works from a fresh copy.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crd::{
    NodeAllocationState, NodeAllocationStateConfig, NodeAllocationStateSpec,
    NodeAllocationStateStatus,
};
use crate::error::{OperatorError, Result};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::{AllocationStateStore, KubeAllocationStateStore};

/// Read-modify-write access to the record of a single node.
#[derive(Clone)]
pub struct StatusClient {
    store: Arc<dyn AllocationStateStore>,
    identity: NodeAllocationStateConfig,
}

impl StatusClient {
    pub fn new(store: Arc<dyn AllocationStateStore>, identity: NodeAllocationStateConfig) -> Self {
        Self { store, identity }
    }

    pub fn identity(&self) -> &NodeAllocationStateConfig {
        &self.identity
    }

    /// Fetch the record, without creating it.
    pub async fn get(&self) -> Result<NodeAllocationState> {
        self.store.get(&self.identity.name).await
    }

    /// Fetch the record, creating a blank one if it does not exist.
    ///
    /// Losing a create race to another writer counts as success and is
    /// followed by a fetch. A record whose Node owner reference points at a
    /// previous incarnation of the node is rewritten with the current owner
    /// before it is returned.
    pub async fn get_or_create(&self) -> Result<NodeAllocationState> {
        let name = &self.identity.name;
        let nas = match self.store.get(name).await {
            Ok(nas) => nas,
            Err(OperatorError::NotFound(_)) => {
                match self.store.create(&self.identity.new_record()).await {
                    Ok(created) => {
                        info!(
                            name = %name,
                            namespace = %self.identity.namespace,
                            "Created NodeAllocationState"
                        );
                        return Ok(created);
                    }
                    Err(OperatorError::AlreadyExists(_)) => {
                        debug!(name = %name, "NodeAllocationState created concurrently, fetching");
                        self.store.get(name).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if self.identity.owns(&nas) {
            return Ok(nas);
        }

        info!(
            name = %name,
            owner_uid = %self.identity.owner.uid,
            "Repairing stale owner reference on NodeAllocationState"
        );
        let mut repaired = nas;
        self.identity.assert_owner(&mut repaired);
        self.store.replace(&repaired).await
    }

    /// Set the status of `observed` and write it, conditional on `observed`'s
    /// resourceVersion. Exactly one write on success, none on failure.
    pub async fn update_status(
        &self,
        observed: &NodeAllocationState,
        status: NodeAllocationStateStatus,
    ) -> Result<NodeAllocationState> {
        let mut updated = observed.clone();
        updated.status = Some(status);
        let written = self.store.replace_status(&updated).await?;
        debug!(
            name = %written.name_any(),
            status = %status,
            resource_version = ?written.resource_version(),
            "Updated NodeAllocationState status"
        );
        Ok(written)
    }

    /// Apply `mutate` to the spec of `observed` and write it, conditional on
    /// `observed`'s resourceVersion. The current owner reference is asserted
    /// on every write.
    pub async fn update_allocations<F>(
        &self,
        observed: &NodeAllocationState,
        mutate: F,
    ) -> Result<NodeAllocationState>
    where
        F: FnOnce(&mut NodeAllocationStateSpec),
    {
        let mut updated = observed.clone();
        mutate(&mut updated.spec);
        self.identity.assert_owner(&mut updated);
        self.store.replace(&updated).await
    }
}

/// Publish `status` for the client's node, retrying the whole
/// get-or-create-then-update cycle on conflicts.
pub async fn set_status(
    client: &StatusClient,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    status: NodeAllocationStateStatus,
) -> Result<NodeAllocationState> {
    let nas = retry_on_conflict(policy, cancel, "set-nas-status", || async move {
        let nas = client.get_or_create().await?;
        client.update_status(&nas, status).await
    })
    .await?;
    info!(
        name = %nas.name_any(),
        namespace = ?nas.namespace(),
        status = %status,
        "Published NodeAllocationState status"
    );
    Ok(nas)
}

/// Look up `node_name` and build a [`StatusClient`] backed by the cluster.
pub async fn connect(
    client: kube::Client,
    node_name: &str,
    namespace: &str,
) -> Result<StatusClient> {
    let nodes: kube::Api<Node> = kube::Api::all(client.clone());
    let node = nodes.get(node_name).await.map_err(|e| match OperatorError::from(e) {
        OperatorError::NotFound(_) => {
            OperatorError::Configuration(format!("node {} does not exist", node_name))
        }
        other => other,
    })?;
    let identity = NodeAllocationStateConfig::for_node(&node, namespace)?;
    debug!(node = %node_name, namespace = %namespace, "Resolved node identity");
    let store = KubeAllocationStateStore::new(client, namespace);
    Ok(StatusClient::new(Arc::new(store), identity))
}
