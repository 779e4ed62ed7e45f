//! NodeAllocationState Custom Resource Definition
//!
//! One NodeAllocationState exists per node, named after the node and living in
//! the driver's namespace. It records which devices the node offers, which
//! claims are bound to which devices, and whether the node's driver is ready
//! to serve claims.
//!
//! The record is owned by its Node object: the cluster garbage collector
//! deletes it together with the node, so nothing in the controller may assume
//! it survives a node deletion.

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::OperatorError;

/// NodeAllocationState is the Schema for the nodeallocationstates API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "nas.gpu.resource.example.com",
    version = "v1alpha1",
    kind = "NodeAllocationState",
    namespaced,
    status = "NodeAllocationStateStatus",
    shortname = "nas",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationStateSpec {
    /// Devices this node can hand out
    #[serde(default)]
    pub allocatable_devices: Vec<AllocatableDevice>,

    /// Claim UID to bound devices
    #[serde(default)]
    pub allocated_claims: BTreeMap<String, AllocatedDevices>,
}

/// A device the node offers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatableDevice {
    pub gpu: AllocatableGpu,
}

/// An allocatable GPU
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatableGpu {
    pub uuid: String,
    #[serde(default)]
    pub product_name: String,
}

/// Devices bound to a single claim
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedDevices {
    pub gpu: AllocatedGpus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedGpus {
    #[serde(default)]
    pub devices: Vec<AllocatedGpu>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedGpu {
    pub uuid: String,
}

impl AllocatedDevices {
    /// Binding of exactly one GPU.
    pub fn single_gpu(uuid: &str) -> Self {
        Self {
            gpu: AllocatedGpus {
                devices: vec![AllocatedGpu {
                    uuid: uuid.to_string(),
                }],
            },
        }
    }

    pub fn gpu_uuids(&self) -> impl Iterator<Item = &str> {
        self.gpu.devices.iter().map(|d| d.uuid.as_str())
    }
}

impl NodeAllocationStateSpec {
    /// First allocatable GPU, in declaration order, that no claim holds.
    pub fn first_free_gpu(&self) -> Option<&AllocatableGpu> {
        self.allocatable_devices
            .iter()
            .map(|d| &d.gpu)
            .find(|gpu| {
                !self
                    .allocated_claims
                    .values()
                    .any(|bound| bound.gpu_uuids().any(|u| u == gpu.uuid))
            })
    }
}

/// Readiness of the node's driver, published through the status subresource.
///
/// Serialized as the bare strings `Ready` / `NotReady`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum NodeAllocationStateStatus {
    Ready,
    NotReady,
}

impl NodeAllocationStateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAllocationStateStatus::Ready => "Ready",
            NodeAllocationStateStatus::NotReady => "NotReady",
        }
    }
}

impl fmt::Display for NodeAllocationStateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeAllocationStateStatus {
    type Err = OperatorError;

    /// Case-insensitive; `ready`, `READY` and `Ready` all map to `Ready`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        if lower == "ready" {
            Ok(NodeAllocationStateStatus::Ready)
        } else if lower == "notready" {
            Ok(NodeAllocationStateStatus::NotReady)
        } else {
            Err(OperatorError::Validation(format!("unknown status: {}", s)))
        }
    }
}

/// Identity a NodeAllocationState is created from.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAllocationStateConfig {
    pub name: String,
    pub namespace: String,
    pub owner: OwnerReference,
}

impl NodeAllocationStateConfig {
    /// Identity for the record of `node`, bound to the node's current UID.
    pub fn for_node(node: &Node, namespace: &str) -> crate::error::Result<Self> {
        let name = node.name_any();
        let uid = node.metadata.uid.clone().ok_or_else(|| {
            OperatorError::InvalidState(format!("node {} has no uid", name))
        })?;
        Ok(Self {
            owner: node_owner_reference(&name, &uid),
            name,
            namespace: namespace.to_string(),
        })
    }

    /// A blank record: empty payload, status unset.
    pub fn new_record(&self) -> NodeAllocationState {
        NodeAllocationState {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            spec: NodeAllocationStateSpec::default(),
            status: None,
        }
    }

    /// Whether the record's Node owner reference matches this identity's.
    pub fn owns(&self, nas: &NodeAllocationState) -> bool {
        nas.owner_references()
            .iter()
            .any(|o| o.kind == "Node" && o.uid == self.owner.uid)
            && !has_stale_node_owner(nas, &self.owner.uid)
    }

    /// Replaces every Node owner reference on `nas` with the current one.
    pub fn assert_owner(&self, nas: &mut NodeAllocationState) {
        let mut owners: Vec<OwnerReference> = nas
            .owner_references()
            .iter()
            .filter(|o| o.kind != "Node")
            .cloned()
            .collect();
        owners.push(self.owner.clone());
        nas.metadata.owner_references = Some(owners);
    }
}

fn has_stale_node_owner(nas: &NodeAllocationState, uid: &str) -> bool {
    nas.owner_references()
        .iter()
        .any(|o| o.kind == "Node" && o.uid != uid)
}

/// Owner reference pointing at a Node.
pub fn node_owner_reference(name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: None,
        block_owner_deletion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeAllocationStateConfig {
        NodeAllocationStateConfig {
            name: "worker-1".to_string(),
            namespace: "dra-example-driver".to_string(),
            owner: node_owner_reference("worker-1", "uid-1"),
        }
    }

    fn gpu(uuid: &str) -> AllocatableDevice {
        AllocatableDevice {
            gpu: AllocatableGpu {
                uuid: uuid.to_string(),
                product_name: "LATEST-GPU-MODEL".to_string(),
            },
        }
    }

    #[test]
    fn test_status_parsing_is_case_insensitive() {
        for input in ["ready", "READY", "Ready"] {
            assert_eq!(
                input.parse::<NodeAllocationStateStatus>().unwrap(),
                NodeAllocationStateStatus::Ready
            );
        }
        for input in ["notready", "NOTREADY", "NotReady"] {
            assert_eq!(
                input.parse::<NodeAllocationStateStatus>().unwrap(),
                NodeAllocationStateStatus::NotReady
            );
        }
    }

    #[test]
    fn test_status_parsing_rejects_unknown_values() {
        for input in ["", "not-ready", "Readyy", "true"] {
            let err = input.parse::<NodeAllocationStateStatus>().unwrap_err();
            assert!(matches!(err, OperatorError::Validation(_)), "{}", input);
        }
    }

    #[test]
    fn test_status_serializes_as_bare_string() {
        let json = serde_json::to_string(&NodeAllocationStateStatus::NotReady).unwrap();
        assert_eq!(json, r#""NotReady""#);
    }

    #[test]
    fn test_new_record_is_blank_and_owned() {
        let id = identity();
        let nas = id.new_record();
        assert_eq!(nas.name_any(), "worker-1");
        assert_eq!(nas.namespace().as_deref(), Some("dra-example-driver"));
        assert!(nas.status.is_none());
        assert!(nas.spec.allocated_claims.is_empty());
        assert!(id.owns(&nas));
    }

    #[test]
    fn test_assert_owner_replaces_stale_node_owner() {
        let id = identity();
        let mut nas = id.new_record();
        nas.metadata.owner_references = Some(vec![node_owner_reference("worker-1", "old-uid")]);
        assert!(!id.owns(&nas));

        id.assert_owner(&mut nas);
        let owners = nas.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");
        assert!(id.owns(&nas));
    }

    #[test]
    fn test_for_node_requires_uid() {
        let mut node = Node::default();
        node.metadata.name = Some("worker-1".to_string());
        assert!(NodeAllocationStateConfig::for_node(&node, "ns").is_err());

        node.metadata.uid = Some("uid-1".to_string());
        let id = NodeAllocationStateConfig::for_node(&node, "ns").unwrap();
        assert_eq!(id.owner.uid, "uid-1");
        assert_eq!(id.owner.kind, "Node");
        assert_eq!(id.owner.api_version, "v1");
    }

    #[test]
    fn test_first_free_gpu_skips_bound_devices() {
        let mut spec = NodeAllocationStateSpec {
            allocatable_devices: vec![gpu("gpu-0"), gpu("gpu-1")],
            ..Default::default()
        };
        assert_eq!(spec.first_free_gpu().unwrap().uuid, "gpu-0");

        spec.allocated_claims
            .insert("claim-a".to_string(), AllocatedDevices::single_gpu("gpu-0"));
        assert_eq!(spec.first_free_gpu().unwrap().uuid, "gpu-1");

        spec.allocated_claims
            .insert("claim-b".to_string(), AllocatedDevices::single_gpu("gpu-1"));
        assert!(spec.first_free_gpu().is_none());
    }

    #[test]
    fn test_spec_defaults_from_empty_json() {
        let spec: NodeAllocationStateSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.allocatable_devices.is_empty());
        assert!(spec.allocated_claims.is_empty());
    }
}
