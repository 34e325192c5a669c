//! Field Indexes
//!
//! Secondary lookups used by the controllers. Every index is registered on
//! the store before the controllers start, and the router uses the same
//! extractors to turn an event on one kind into keys of another.

use std::sync::Arc;

use crate::crd::{
    LoadBalancer, NatGateway, Network, NetworkInterface, Prefix, VirtualIp,
};
use crate::domain::ports::{IndexFn, Kind, Kinded, Object, ObjectStore};
use crate::error::Result;
use crate::ownership::controller_of;
use crate::peering::Peer;

/// Name of the network an object attaches to.
pub const NETWORK: &str = "network";
/// Name of the VirtualIp a NetworkInterface references.
pub const VIRTUAL_IP: &str = "virtual-ip";
/// `namespace/name` of every network a Network peers with.
pub const PEER: &str = "peer";
/// UID of the claimant recorded in a Prefix or VirtualIp.
pub const CLAIM_UID: &str = "claim-uid";
/// UID of the controller owner.
pub const OWNER_UID: &str = "owner-uid";
/// The object's own UID.
pub const UID: &str = "uid";

fn typed<T: Kinded>(f: fn(&T) -> Vec<String>) -> IndexFn {
    Arc::new(move |object: &Object| T::from_object_ref(object).map(f).unwrap_or_default())
}

fn owner_uid(object: &Object) -> Vec<String> {
    controller_of(object.meta())
        .map(|r| vec![r.uid.clone()])
        .unwrap_or_default()
}

/// Register every index the controllers rely on.
pub fn register_all(store: &dyn ObjectStore) -> Result<()> {
    store.register_index(
        Kind::NetworkInterface,
        NETWORK,
        typed::<NetworkInterface>(|nic| vec![nic.spec.network_ref.name.clone()]),
    )?;
    store.register_index(
        Kind::LoadBalancer,
        NETWORK,
        typed::<LoadBalancer>(|lb| vec![lb.spec.network_ref.name.clone()]),
    )?;
    store.register_index(
        Kind::NatGateway,
        NETWORK,
        typed::<NatGateway>(|gw| vec![gw.spec.network_ref.name.clone()]),
    )?;
    store.register_index(
        Kind::NetworkInterface,
        VIRTUAL_IP,
        typed::<NetworkInterface>(|nic| {
            nic.virtual_ip_ref_name().map(str::to_string).into_iter().collect()
        }),
    )?;
    store.register_index(
        Kind::Network,
        PEER,
        typed::<Network>(|network| {
            network
                .references()
                .iter()
                .map(|r| format!("{}/{}", r.namespace, r.name))
                .collect()
        }),
    )?;
    store.register_index(
        Kind::Prefix,
        CLAIM_UID,
        typed::<Prefix>(|prefix| {
            prefix.spec.claim_ref.iter().map(|c| c.uid.clone()).collect()
        }),
    )?;
    store.register_index(
        Kind::VirtualIp,
        CLAIM_UID,
        typed::<VirtualIp>(|vip| vip.spec.target_ref.iter().map(|c| c.uid.clone()).collect()),
    )?;
    store.register_index(Kind::NetworkInterface, UID, Arc::new(uid_of))?;
    for kind in [
        Kind::Prefix,
        Kind::VirtualIp,
        Kind::LoadBalancerRouting,
        Kind::NatGatewayRouting,
    ] {
        store.register_index(kind, OWNER_UID, Arc::new(owner_uid))?;
    }
    Ok(())
}

// =============================================================================
// Router Extractors
// =============================================================================

pub fn name_of(object: &Object) -> Vec<String> {
    object.meta().name.iter().cloned().collect()
}

pub fn namespaced_name_of(object: &Object) -> Vec<String> {
    vec![object.key().namespaced_name()]
}

pub fn uid_of(object: &Object) -> Vec<String> {
    object.uid().map(str::to_string).into_iter().collect()
}

/// Claimant UID of a Prefix or VirtualIp.
pub fn claimant_uid_of(object: &Object) -> Vec<String> {
    match object {
        Object::Prefix(prefix) => prefix.spec.claim_ref.iter().map(|c| c.uid.clone()).collect(),
        Object::VirtualIp(vip) => vip.spec.target_ref.iter().map(|c| c.uid.clone()).collect(),
        _ => Vec::new(),
    }
}

/// Network of a NetworkInterface.
pub fn network_of(object: &Object) -> Vec<String> {
    NetworkInterface::from_object_ref(object)
        .map(|nic| vec![nic.spec.network_ref.name.clone()])
        .unwrap_or_default()
}
