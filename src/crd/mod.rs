//! Custom Resource Definitions for the NAS controller
//!
//! - NodeAllocationState: per-node allocation state and readiness

mod node_allocation_state;

pub use node_allocation_state::{
    node_owner_reference, AllocatableDevice, AllocatableGpu, AllocatedDevices, AllocatedGpu,
    AllocatedGpus, NodeAllocationState, NodeAllocationStateConfig, NodeAllocationStateSpec,
    NodeAllocationStateStatus,
};
