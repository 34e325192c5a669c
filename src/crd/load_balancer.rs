//! LoadBalancer and LoadBalancerRouting Custom Resource Definitions
//!
//! The LoadBalancer declares which interfaces it balances across; the
//! LoadBalancerRouting is a derived projection owned by the LoadBalancer and
//! rebuilt on every reconcile.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, IpFamily, LabelSelector, LocalRef};

// =============================================================================
// LoadBalancer CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    shortname = "lb",
    status = "LoadBalancerStatus",
    namespaced,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Destinations", "type": "integer", "jsonPath": ".status.destinationCount"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub network_ref: LocalRef,

    #[serde(default)]
    pub r#type: LoadBalancerType,

    #[serde(default)]
    pub ip_families: Vec<IpFamily>,

    /// Frontend IPs
    #[serde(default)]
    pub ips: Vec<String>,

    /// Interfaces to balance across; unset selects nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface_selector: Option<LabelSelector>,

    #[serde(default)]
    pub ports: Vec<LoadBalancerPort>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LoadBalancerType {
    #[default]
    Public,
    Internal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub destination_count: u32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl LoadBalancer {
    /// Whether an IP family is served. An empty family list serves all.
    pub fn serves_family(&self, family: IpFamily) -> bool {
        self.spec.ip_families.is_empty() || self.spec.ip_families.contains(&family)
    }
}

// =============================================================================
// LoadBalancerRouting CRD
// =============================================================================

/// Concrete destinations of a LoadBalancer. Never edited by hand.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "LoadBalancerRouting",
    plural = "loadbalancerroutings",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRoutingSpec {
    pub network_ref: LocalRef,

    #[serde(default)]
    pub destinations: Vec<LoadBalancerDestination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDestination {
    /// UID of the target interface
    pub uid: String,
    pub name: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}
