//! NodeAllocationState driver callbacks
//!
//! Binds claims to devices listed in the node's NodeAllocationState. All
//! claims of a node share that one record, so every mutation is a full
//! get-modify-write cycle under [`retry_on_conflict`]: two workers editing
//! different claims race on the resourceVersion and the loser re-applies its
//! change to the winner's copy.

use std::sync::Arc;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ClaimRequest, ReconcileCallbacks};
use crate::crd::{AllocatedDevices, NodeAllocationState, NodeAllocationStateStatus};
use crate::error::{OperatorError, Result};
use crate::metrics::ControllerMetrics;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::status_client::StatusClient;

/// Driver callbacks for one node.
pub struct NasDriver {
    client: StatusClient,
    retry: RetryPolicy,
    cancel: CancellationToken,
    metrics: Arc<ControllerMetrics>,
}

impl NasDriver {
    pub fn new(
        client: StatusClient,
        retry: RetryPolicy,
        cancel: CancellationToken,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            client,
            retry,
            cancel,
            metrics,
        }
    }

    fn observe_write(&self, result: Result<NodeAllocationState>) -> Result<NodeAllocationState> {
        match &result {
            Ok(_) => self.metrics.record_write(),
            Err(e) if e.is_conflict() => self.metrics.record_conflict(),
            Err(_) => {}
        }
        result
    }

    async fn prepare_once(&self, uid: &str) -> Result<AllocatedDevices> {
        let nas = self.client.get_or_create().await?;

        if nas.status != Some(NodeAllocationStateStatus::Ready) {
            return Err(OperatorError::NotReady(format!(
                "NodeAllocationState {} status is {}",
                nas.name_any(),
                nas.status.map(|s| s.as_str()).unwrap_or("unset")
            )));
        }

        if let Some(existing) = nas.spec.allocated_claims.get(uid) {
            debug!(claim = %uid, "Claim already bound");
            return Ok(existing.clone());
        }

        let gpu = nas.spec.first_free_gpu().ok_or_else(|| {
            OperatorError::ResourceExhausted(format!(
                "no free device on node {} for claim {}",
                nas.name_any(),
                uid
            ))
        })?;
        let devices = AllocatedDevices::single_gpu(&gpu.uuid);

        let binding = devices.clone();
        self.observe_write(
            self.client
                .update_allocations(&nas, |spec| {
                    spec.allocated_claims.insert(uid.to_string(), binding);
                })
                .await,
        )?;
        Ok(devices)
    }

    async fn unprepare_once(&self, uid: &str) -> Result<()> {
        let nas = match self.client.get().await {
            Ok(nas) => nas,
            // The record goes away with its node; nothing is left to release.
            Err(e) if e.is_not_found() => {
                info!(claim = %uid, "NodeAllocationState is gone, nothing to unprepare");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !nas.spec.allocated_claims.contains_key(uid) {
            debug!(claim = %uid, "Claim not bound, unprepare is a no-op");
            return Ok(());
        }

        self.observe_write(
            self.client
                .update_allocations(&nas, |spec| {
                    spec.allocated_claims.remove(uid);
                })
                .await,
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReconcileCallbacks for NasDriver {
    async fn on_prepare(&self, claim: &ClaimRequest) -> Result<AllocatedDevices> {
        let uid = claim.uid.as_str();
        let devices = retry_on_conflict(&self.retry, &self.cancel, "prepare", || {
            self.prepare_once(uid)
        })
        .await?;
        info!(
            claim = %claim.name,
            namespace = %claim.namespace,
            uid = %uid,
            devices = ?devices.gpu_uuids().collect::<Vec<_>>(),
            "Prepared claim"
        );
        Ok(devices)
    }

    async fn on_unprepare(&self, claim: &ClaimRequest) -> Result<()> {
        let uid = claim.uid.as_str();
        retry_on_conflict(&self.retry, &self.cancel, "unprepare", || {
            self.unprepare_once(uid)
        })
        .await?;
        info!(
            claim = %claim.name,
            namespace = %claim.namespace,
            uid = %uid,
            "Unprepared claim"
        );
        Ok(())
    }

    async fn on_list(&self) -> Result<Vec<String>> {
        match self.client.get().await {
            Ok(nas) => Ok(nas.spec.allocated_claims.into_keys().collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::ClaimOperation;
    use crate::crd::{
        node_owner_reference, AllocatableDevice, AllocatableGpu, NodeAllocationStateConfig,
    };
    use crate::store::memory::InMemoryStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn identity() -> NodeAllocationStateConfig {
        NodeAllocationStateConfig {
            name: "worker-1".to_string(),
            namespace: "dra-example-driver".to_string(),
            owner: node_owner_reference("worker-1", "uid-1"),
        }
    }

    fn seeded_store(gpus: &[&str], status: Option<NodeAllocationStateStatus>) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let mut nas = identity().new_record();
        nas.spec.allocatable_devices = gpus
            .iter()
            .map(|uuid| AllocatableDevice {
                gpu: AllocatableGpu {
                    uuid: uuid.to_string(),
                    product_name: "LATEST-GPU-MODEL".to_string(),
                },
            })
            .collect();
        nas.status = status;
        store.seed(nas);
        store
    }

    fn driver(store: Arc<InMemoryStore>) -> (NasDriver, Arc<ControllerMetrics>) {
        let metrics = Arc::new(ControllerMetrics::new());
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: 0.5,
        };
        let driver = NasDriver::new(
            StatusClient::new(store, identity()),
            policy,
            CancellationToken::new(),
            metrics.clone(),
        );
        (driver, metrics)
    }

    fn claim(uid: &str, operation: ClaimOperation) -> ClaimRequest {
        ClaimRequest {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: format!("claim-{}", uid),
            operation,
        }
    }

    #[tokio::test]
    async fn test_prepare_binds_first_free_gpu() {
        let store = seeded_store(&["gpu-0", "gpu-1"], Some(NodeAllocationStateStatus::Ready));
        let (driver, metrics) = driver(store.clone());

        let devices = driver
            .on_prepare(&claim("a", ClaimOperation::Prepare))
            .await
            .unwrap();
        assert_eq!(devices, AllocatedDevices::single_gpu("gpu-0"));

        let stored = store.stored("worker-1").unwrap();
        assert_eq!(stored.spec.allocated_claims["a"], devices);
        assert_eq!(metrics.record_writes_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let store = seeded_store(&["gpu-0", "gpu-1"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store.clone());

        let first = driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        let writes = store.writes();
        let second = driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_prepare_requires_ready_record() {
        for status in [None, Some(NodeAllocationStateStatus::NotReady)] {
            let store = seeded_store(&["gpu-0"], status);
            let (driver, _) = driver(store.clone());
            let writes = store.writes();

            let err = driver
                .on_prepare(&claim("a", ClaimOperation::Prepare))
                .await
                .unwrap_err();
            assert!(matches!(err, OperatorError::NotReady(_)));
            assert!(!err.is_terminal());
            assert_eq!(store.writes(), writes);
        }
    }

    #[tokio::test]
    async fn test_prepare_without_free_device_is_retryable() {
        let store = seeded_store(&["gpu-0"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store);

        driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        let err = driver
            .on_prepare(&claim("b", ClaimOperation::Prepare))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::ResourceExhausted(_)));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_unprepare_removes_binding() {
        let store = seeded_store(&["gpu-0"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store.clone());

        driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        driver
            .on_unprepare(&claim("a", ClaimOperation::Unprepare))
            .await
            .unwrap();
        assert!(store.stored("worker-1").unwrap().spec.allocated_claims.is_empty());
    }

    #[tokio::test]
    async fn test_unprepare_of_released_claim_does_not_write() {
        let store = seeded_store(&["gpu-0"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store.clone());

        driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        driver.on_unprepare(&claim("a", ClaimOperation::Unprepare)).await.unwrap();
        let before = store.stored("worker-1").unwrap();
        let writes = store.writes();

        driver.on_unprepare(&claim("a", ClaimOperation::Unprepare)).await.unwrap();
        let after = store.stored("worker-1").unwrap();
        assert_eq!(store.writes(), writes);
        assert_eq!(before.spec, after.spec);
        assert_eq!(before.resource_version(), after.resource_version());
    }

    #[tokio::test]
    async fn test_unprepare_when_record_is_gone() {
        let store = Arc::new(InMemoryStore::new());
        let (driver, _) = driver(store.clone());

        driver
            .on_unprepare(&claim("a", ClaimOperation::Unprepare))
            .await
            .unwrap();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_prepare_unprepare_prepare_restores_binding() {
        let store = seeded_store(&["gpu-0", "gpu-1"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store.clone());

        let first = driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        let payload = store.stored("worker-1").unwrap().spec;
        driver.on_unprepare(&claim("a", ClaimOperation::Unprepare)).await.unwrap();
        let again = driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(store.stored("worker-1").unwrap().spec, payload);
    }

    #[tokio::test]
    async fn test_concurrent_prepares_lose_no_update() {
        let store = seeded_store(
            &["gpu-0", "gpu-1", "gpu-2"],
            Some(NodeAllocationStateStatus::Ready),
        );
        let (driver, metrics) = driver(store.clone());

        let (claim_a, claim_b, claim_c) = (
            claim("a", ClaimOperation::Prepare),
            claim("b", ClaimOperation::Prepare),
            claim("c", ClaimOperation::Prepare),
        );
        let (a, b, c) = tokio::join!(
            driver.on_prepare(&claim_a),
            driver.on_prepare(&claim_b),
            driver.on_prepare(&claim_c),
        );
        let mut bound: Vec<String> = [a.unwrap(), b.unwrap(), c.unwrap()]
            .iter()
            .flat_map(|d| d.gpu_uuids().map(str::to_string).collect::<Vec<_>>())
            .collect();
        bound.sort();
        assert_eq!(bound, vec!["gpu-0", "gpu-1", "gpu-2"]);

        let stored = store.stored("worker-1").unwrap();
        assert_eq!(stored.spec.allocated_claims.len(), 3);
        assert!(metrics.conflicts_total.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_on_list_reports_bound_claims() {
        let store = seeded_store(&["gpu-0", "gpu-1"], Some(NodeAllocationStateStatus::Ready));
        let (driver, _) = driver(store);

        assert!(driver.on_list().await.unwrap().is_empty());
        driver.on_prepare(&claim("a", ClaimOperation::Prepare)).await.unwrap();
        driver.on_prepare(&claim("b", ClaimOperation::Prepare)).await.unwrap();

        let mut listed = driver.on_list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_on_list_without_record() {
        let (driver, _) = driver(Arc::new(InMemoryStore::new()));
        assert!(driver.on_list().await.unwrap().is_empty());
    }
}
