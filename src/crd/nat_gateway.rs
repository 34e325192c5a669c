//! NatGateway and NatGatewayRouting Custom Resource Definitions
//!
//! A NatGateway shares a small pool of public IPs among the interfaces of a
//! network by handing each interface a fixed-size port range per IP family.
//! The NatGatewayRouting records the allocation and is owned by the gateway.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LabelSelector, LocalRef};

/// Default number of ports handed to each interface.
pub const DEFAULT_PORTS_PER_NETWORK_INTERFACE: u32 = 2048;

fn default_ports_per_network_interface() -> u32 {
    DEFAULT_PORTS_PER_NETWORK_INTERFACE
}

// =============================================================================
// NatGateway CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "NatGateway",
    plural = "natgateways",
    shortname = "natgw",
    status = "NatGatewayStatus",
    namespaced,
    printcolumn = r#"{"name": "Ports/NIC", "type": "integer", "jsonPath": ".spec.portsPerNetworkInterface"}"#,
    printcolumn = r#"{"name": "Ports Used", "type": "integer", "jsonPath": ".status.portsUsed"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NatGatewaySpec {
    pub network_ref: LocalRef,

    /// Public IPs of the gateway. Entries without an address are pending.
    #[serde(default)]
    pub ips: Vec<NatGatewayIp>,

    /// Ports per interface and IP family; must be a power of two.
    #[serde(default = "default_ports_per_network_interface")]
    pub ports_per_network_interface: u32,

    /// Interfaces served by the gateway; unset selects all interfaces of
    /// the network that have no virtual IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NatGatewayIp {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NatGatewayStatus {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub ports_used: u32,

    #[serde(default)]
    pub requested_network_interfaces: u32,

    #[serde(default)]
    pub used_network_interfaces: u32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// NatGatewayRouting CRD
// =============================================================================

/// Port allocations of a NatGateway. Never edited by hand.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "NatGatewayRouting",
    plural = "natgatewayroutings",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NatGatewayRoutingSpec {
    pub network_ref: LocalRef,

    #[serde(default)]
    pub destinations: Vec<NatDestination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NatDestination {
    /// UID of the target interface
    pub uid: String,
    pub name: String,
    pub ips: Vec<NatDestinationIp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NatDestinationIp {
    pub ip: String,
    pub port: u16,
    pub end_port: u16,
}
