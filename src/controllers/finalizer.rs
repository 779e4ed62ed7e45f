//! The claim finalizer and the seam that writes it.

use async_trait::async_trait;
use k8s_openapi::api::resource::v1alpha2::ResourceClaim;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// Finalizer that keeps a claim around until its binding is released.
pub const CLAIM_FINALIZER: &str = "gpu.resource.example.com/deletion-protection";

/// Writes finalizer lists on ResourceClaims.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClaimFinalizers: Send + Sync {
    /// Replace the claim's finalizers, conditional on `resource_version`
    /// when one is given. A claim that no longer exists is `NotFound`.
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()>;
}

/// Finalizer writes through the Kubernetes API.
pub struct KubeClaimFinalizers {
    client: Client,
}

impl KubeClaimFinalizers {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClaimFinalizers for KubeClaimFinalizers {
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let claims: Api<ResourceClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers
            }
        });
        claims
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Finalizers of `claim` with ours appended, or `None` if it is already set.
pub fn finalizers_with(claim: &ResourceClaim) -> Option<Vec<String>> {
    if claim.finalizers().iter().any(|f| f == CLAIM_FINALIZER) {
        return None;
    }
    let mut finalizers = claim.finalizers().to_vec();
    finalizers.push(CLAIM_FINALIZER.to_string());
    Some(finalizers)
}

/// Finalizers of `claim` without ours, or `None` if it is not set.
pub fn finalizers_without(claim: &ResourceClaim) -> Option<Vec<String>> {
    if !claim.finalizers().iter().any(|f| f == CLAIM_FINALIZER) {
        return None;
    }
    Some(
        claim
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != CLAIM_FINALIZER)
            .cloned()
            .collect(),
    )
}
