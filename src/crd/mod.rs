//! Custom Resource Definitions
//!
//! This module contains all CRD definitions reconciled by the control plane.

mod ip;
mod load_balancer;
mod nat_gateway;
mod network;
mod network_interface;
mod types;

use kube::CustomResourceExt;

pub use ip::{
    IpPhase, Prefix, PrefixSpec, PrefixStatus, VirtualIp, VirtualIpSpec, VirtualIpStatus,
};
pub use load_balancer::{
    LoadBalancer, LoadBalancerDestination, LoadBalancerPort, LoadBalancerRouting,
    LoadBalancerRoutingSpec, LoadBalancerSpec, LoadBalancerStatus, LoadBalancerType,
};
pub use nat_gateway::{
    NatDestination, NatDestinationIp, NatGateway, NatGatewayIp, NatGatewayRouting,
    NatGatewayRoutingSpec, NatGatewaySpec, NatGatewayStatus, DEFAULT_PORTS_PER_NETWORK_INTERFACE,
};
pub use network::{
    Network, NetworkPeering, NetworkPeeringStatus, NetworkSpec, NetworkStatus, PeerRef,
    PeeringClaimRef, PeeringPrefix, PeeringState,
};
pub use network_interface::{
    EphemeralPrefixSource, EphemeralVirtualIpSource, IpSource, NetworkInterface,
    NetworkInterfaceSpec, NetworkInterfaceState, NetworkInterfaceStatus, PrefixTemplate,
    VirtualIpSource, VirtualIpTemplate,
};
pub use types::{
    merge_conditions, parse_ip, ClaimRef, Condition, ConditionStatus, IpFamily, LabelSelector,
    LabelSelectorOperator, LabelSelectorRequirement, LocalRef, ReclaimPolicy, TemplateMetadata,
};

/// API group of all networking resources
pub const API_GROUP: &str = "networking.netorch.io";
/// API version of all networking resources
pub const API_VERSION: &str = "networking.netorch.io/v1alpha1";

/// All CRD manifests, in dependency order.
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        Network::crd(),
        NetworkInterface::crd(),
        Prefix::crd(),
        VirtualIp::crd(),
        LoadBalancer::crd(),
        LoadBalancerRouting::crd(),
        NatGateway::crd(),
        NatGatewayRouting::crd(),
    ]
}
