//! Prefix and VirtualIp Custom Resource Definitions
//!
//! Allocatable IP resources. The `phase` and the allocated value are set by
//! an external allocator; the control plane only claims and releases them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClaimRef, IpFamily, ReclaimPolicy};

/// Allocation phase of an IP resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IpPhase {
    #[default]
    Pending,
    Allocated,
    Failed,
}

// =============================================================================
// Prefix CRD
// =============================================================================

/// Prefix is an allocatable address prefix.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "Prefix",
    plural = "prefixes",
    status = "PrefixStatus",
    namespaced,
    printcolumn = r#"{"name": "Prefix", "type": "string", "jsonPath": ".status.prefix"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSpec {
    #[serde(default)]
    pub ip_family: IpFamily,

    /// Requested prefix length; the allocator picks a default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,

    /// Object that currently claims this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimRef>,

    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixStatus {
    #[serde(default)]
    pub phase: IpPhase,

    /// Allocated prefix in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl Prefix {
    /// Allocated prefix, if the allocator has assigned one.
    pub fn allocated(&self) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|s| s.phase == IpPhase::Allocated)
            .and_then(|s| s.prefix.as_deref())
    }
}

// =============================================================================
// VirtualIp CRD
// =============================================================================

/// VirtualIp is an allocatable public address bound to one target interface.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "VirtualIp",
    plural = "virtualips",
    shortname = "vip",
    status = "VirtualIpStatus",
    namespaced,
    printcolumn = r#"{"name": "IP", "type": "string", "jsonPath": ".status.ip"}"#,
    printcolumn = r#"{"name": "Target", "type": "string", "jsonPath": ".spec.targetRef.name"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIpSpec {
    #[serde(default)]
    pub ip_family: IpFamily,

    /// Interface currently bound to this virtual IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ClaimRef>,

    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIpStatus {
    #[serde(default)]
    pub phase: IpPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl VirtualIp {
    /// Allocated address, if the allocator has assigned one.
    pub fn allocated(&self) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|s| s.phase == IpPhase::Allocated)
            .and_then(|s| s.ip.as_deref())
    }
}
