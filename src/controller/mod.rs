//! Controller module
//!
//! The reconciliation runtime (queue, router, manager) and the controllers
//! built on it.
//!
//! ```text
//! watch ──► EventRouter ──► WorkQueue ──► worker ──► Reconciler::reconcile
//!                               ▲                          │
//!                               └──── requeue / backoff ◄──┘
//! ```

pub mod indexes;
mod load_balancer;
mod manager;
mod nat_gateway;
mod network_interface;
mod network_peering;
pub mod queue;
mod reconciler;
mod release;
pub mod router;

use std::sync::Arc;

use crate::crd::{Prefix, VirtualIp};
use crate::error::Result;

pub use load_balancer::{destinations as load_balancer_destinations, LoadBalancerReconciler};
pub use manager::{ControllerManager, ManagerConfig};
pub use nat_gateway::NatGatewayReconciler;
pub use network_interface::{NetworkInterfaceReconciler, VIRTUAL_IP_CLAIM_FINALIZER};
pub use network_peering::NetworkPeeringReconciler;
pub use queue::{QueueConfig, WorkQueue};
pub use reconciler::{Action, Context, Reconciler};
pub use release::{Claimable, ReleaseReconciler};
pub use router::{EventRouter, Mapping, Scope, WatchSpec};

/// Register every controller with `manager`, sharing `ctx`.
pub fn register_all(manager: &mut ControllerManager, ctx: &Arc<Context>) -> Result<()> {
    manager.register(
        Arc::new(NetworkPeeringReconciler::new(ctx.clone())),
        NetworkPeeringReconciler::watch_spec(),
    )?;
    manager.register(
        Arc::new(NetworkInterfaceReconciler::new(ctx.clone())),
        NetworkInterfaceReconciler::watch_spec(),
    )?;
    manager.register(
        Arc::new(LoadBalancerReconciler::new(ctx.clone())),
        LoadBalancerReconciler::watch_spec(),
    )?;
    manager.register(
        Arc::new(NatGatewayReconciler::new(ctx.clone())),
        NatGatewayReconciler::watch_spec(),
    )?;
    manager.register(
        Arc::new(ReleaseReconciler::<VirtualIp>::new(ctx.clone())),
        ReleaseReconciler::<VirtualIp>::watch_spec(),
    )?;
    manager.register(
        Arc::new(ReleaseReconciler::<Prefix>::new(ctx.clone())),
        ReleaseReconciler::<Prefix>::watch_spec(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::absence::AbsenceCache;
    use crate::adapters::{InMemoryEventCollector, MemoryStore};

    #[test]
    fn test_register_all_names() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Context::new(
            store.clone(),
            Arc::new(InMemoryEventCollector::new()),
            Arc::new(AbsenceCache::default()),
        );
        let mut manager = ControllerManager::new(store, ManagerConfig::default());
        register_all(&mut manager, &ctx).unwrap();

        assert_eq!(
            manager.controller_names(),
            vec![
                "network-peering",
                "network-interface",
                "load-balancer",
                "nat-gateway",
                "virtual-ip-release",
                "prefix-release",
            ]
        );
    }
}
