//! NodeAllocationState controller
//!
//! Node-level allocation controller for an example GPU dynamic resource
//! allocation driver. It watches `ResourceClaim`s, binds them to devices in
//! the node's `NodeAllocationState` and publishes the node's readiness.
//!
//! ## Custom Resources
//!
//! - `NodeAllocationState`: per-node record of allocatable devices, claim
//!   bindings and readiness
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: nas.gpu.resource.example.com/v1alpha1
//! kind: NodeAllocationState
//! metadata:
//!   name: worker-1
//!   namespace: dra-example-driver
//! spec:
//!   allocatableDevices:
//!     - gpu:
//!         uuid: GPU-0
//!         productName: Example GPU
//!   allocatedClaims: {}
//! status: Ready
//! ```

pub mod cli;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod status_client;
pub mod store;

pub use config::ControllerConfig;
pub use controllers::{ClaimOperation, ClaimRequest, NasDriver, ReconcileCallbacks, ReconciliationEngine};
pub use crd::{
    NodeAllocationState, NodeAllocationStateConfig, NodeAllocationStateSpec,
    NodeAllocationStateStatus,
};
pub use error::{OperatorError, Result};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use status_client::{set_status, StatusClient};
pub use store::{AllocationStateStore, KubeAllocationStateStore};
