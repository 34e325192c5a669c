//! NatGateway Controller
//!
//! Hands every eligible interface of the gateway's network one port range per
//! IP family it uses, and records the result in a NatGatewayRouting owned by
//! the gateway. Eligible interfaces are the selected, non-terminating ones
//! without a virtual IP and with at least one reported address.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::indexes;
use super::reconciler::{Action, Context, Reconciler};
use super::router::{Scope, WatchSpec};
use crate::allocator::{allocate, SlotLayout, Target};
use crate::crd::{
    merge_conditions, parse_ip, Condition, ConditionStatus, IpFamily, NatGateway,
    NatGatewayRouting, NatGatewayRoutingSpec, NatGatewayStatus, NetworkInterface,
};
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{Kind, ListParams, ObjectKey, StoreExt};
use crate::error::{Error, Result};
use crate::metrics;
use crate::ownership::{is_controlled_by, set_controller_reference};

pub struct NatGatewayReconciler {
    ctx: Arc<Context>,
}

impl NatGatewayReconciler {
    pub const NAME: &'static str = "nat-gateway";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn watch_spec() -> WatchSpec {
        WatchSpec::new(Kind::NatGateway)
            .owns(Kind::NatGatewayRouting)
            .watches(
                Kind::NetworkInterface,
                indexes::NETWORK,
                indexes::network_of,
                Scope::SameNamespace,
            )
    }

    async fn targets(&self, gateway: &NatGateway) -> Result<Vec<Target>> {
        let params = ListParams::namespaced(gateway.namespace().unwrap_or_default())
            .field(indexes::NETWORK, &gateway.spec.network_ref.name);
        let nics = self.ctx.store.list_typed::<NetworkInterface>(&params).await?;

        Ok(nics
            .iter()
            .filter(|nic| nic.meta().deletion_timestamp.is_none())
            .filter(|nic| !nic.has_virtual_ip())
            .filter(|nic| {
                gateway
                    .spec
                    .network_interface_selector
                    .as_ref()
                    .map_or(true, |s| s.matches(nic.labels()))
            })
            .filter_map(target_of)
            .collect())
    }

    /// Record a rejected spec in status and return the error.
    async fn reject(&self, gateway: &NatGateway, error: Error) -> Result<Action> {
        warn!(error = %error, "Rejecting gateway spec");
        let existing = gateway.status.clone().unwrap_or_default();
        let condition = Condition::new(
            "Ready",
            ConditionStatus::False,
            "InvalidSpec",
            error.to_string(),
        );
        let computed = NatGatewayStatus {
            conditions: merge_conditions(&existing.conditions, vec![condition]),
            ..existing.clone()
        };
        self.ctx
            .write_status(gateway, gateway.status.as_ref(), &computed)
            .await?;
        Err(error)
    }

    /// Create or update the routing object. Returns `false` if the name is
    /// taken by an object this gateway does not control.
    async fn write_routing(
        &self,
        gateway: &NatGateway,
        existing: Option<&NatGatewayRouting>,
        spec: NatGatewayRoutingSpec,
    ) -> Result<bool> {
        let key = ObjectKey::new(
            Kind::NatGatewayRouting,
            gateway.namespace().unwrap_or_default(),
            gateway.name_any(),
        );
        match existing {
            None => {
                let mut metadata = kube::api::ObjectMeta {
                    name: Some(key.name.clone()),
                    namespace: Some(key.namespace.clone()),
                    ..Default::default()
                };
                set_controller_reference(&mut metadata, gateway)?;
                match self
                    .ctx
                    .store
                    .create_typed(NatGatewayRouting { metadata, spec })
                    .await
                {
                    Ok(_) => {
                        info!(routing = %key, "Created NAT routing");
                        self.ctx
                            .publish(ReconcileEvent::child_created(
                                Kind::NatGatewayRouting,
                                &key.namespace,
                                &key.name,
                                gateway.name_any(),
                            ))
                            .await;
                        Ok(true)
                    }
                    Err(e) if e.is_already_exists() => Err(Error::conflict(key)),
                    Err(e) => Err(e),
                }
            }
            Some(routing) if !is_controlled_by(routing.meta(), gateway.meta()) => {
                warn!(routing = %key, "Routing object not controlled by gateway");
                self.ctx
                    .publish(ReconcileEvent::child_foreign(
                        Kind::NatGatewayRouting,
                        &key.namespace,
                        &key.name,
                        gateway.name_any(),
                    ))
                    .await;
                Ok(false)
            }
            Some(routing) if routing.spec == spec => {
                debug!("Routing unchanged");
                Ok(true)
            }
            Some(routing) => {
                self.ctx
                    .store
                    .patch(
                        &key,
                        routing.meta().resource_version.as_deref(),
                        &json!({ "spec": spec }),
                    )
                    .await?;
                info!(routing = %key, destinations = spec.destinations.len(), "Updated NAT routing");
                Ok(true)
            }
        }
    }
}

/// Allocation target for an interface, if it reports any address.
fn target_of(nic: &NetworkInterface) -> Option<Target> {
    let families: BTreeSet<IpFamily> = nic
        .status_ips()
        .iter()
        .filter_map(|value| parse_ip(value))
        .map(|ip| IpFamily::of(&ip))
        .collect();
    if families.is_empty() {
        return None;
    }
    Some(Target {
        uid: nic.metadata.uid.clone()?,
        name: nic.name_any(),
        families,
    })
}

#[async_trait]
impl Reconciler for NatGatewayReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> Kind {
        Kind::NatGateway
    }

    #[instrument(skip(self), fields(gateway = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(gateway) = self
            .ctx
            .store
            .get_opt::<NatGateway>(&key.namespace, &key.name)
            .await?
        else {
            metrics::clear_nat_ports_used(&key.namespace, &key.name);
            return Ok(Action::await_change());
        };
        if gateway.meta().deletion_timestamp.is_some() {
            metrics::clear_nat_ports_used(&key.namespace, &key.name);
            return Ok(Action::await_change());
        }

        let layout = match SlotLayout::new(gateway.spec.ports_per_network_interface) {
            Ok(layout) => layout,
            Err(e) => return self.reject(&gateway, e).await,
        };
        if gateway.spec.ips.is_empty() {
            let e = Error::Validation("gateway declares no ips".into());
            return self.reject(&gateway, e).await;
        }

        let mut pool: Vec<IpAddr> = Vec::new();
        let mut pending = Vec::new();
        for entry in &gateway.spec.ips {
            match entry.ip.as_deref().map(|value| (value, parse_ip(value))) {
                Some((_, Some(ip))) => pool.push(ip),
                Some((value, None)) => {
                    let e = Error::Validation(format!("ip {} has invalid address {}", entry.name, value));
                    return self.reject(&gateway, e).await;
                }
                None => pending.push(entry.name.clone()),
            }
        }

        let targets = self.targets(&gateway).await?;
        let existing = self
            .ctx
            .store
            .get_opt::<NatGatewayRouting>(&key.namespace, &key.name)
            .await?;
        let previous = existing
            .as_ref()
            .filter(|r| is_controlled_by(r.meta(), gateway.meta()))
            .map(|r| r.spec.destinations.as_slice())
            .unwrap_or(&[]);

        let allocation = allocate(&layout, &pool, &targets, previous)?;
        for name in &allocation.dropped {
            self.ctx
                .publish(ReconcileEvent::nat_target_dropped(&key.namespace, &key.name, name))
                .await;
        }

        let used = allocation.destinations.len() as u32;
        let ports_used = allocation.ports_used;
        let dropped = allocation.dropped.len();
        let spec = NatGatewayRoutingSpec {
            network_ref: gateway.spec.network_ref.clone(),
            destinations: allocation.destinations,
        };
        let owned = self.write_routing(&gateway, existing.as_ref(), spec).await?;

        let condition = if !owned {
            Condition::new(
                "Ready",
                ConditionStatus::False,
                "RoutingConflict",
                "routing object exists and is not controlled by this gateway",
            )
        } else if !pending.is_empty() {
            Condition::new(
                "Ready",
                ConditionStatus::False,
                "IpsPending",
                format!("waiting for addresses of {}", pending.join(", ")),
            )
        } else if dropped > 0 {
            Condition::new(
                "Ready",
                ConditionStatus::False,
                "PortsExhausted",
                format!("{} network interfaces got no port range", dropped),
            )
        } else {
            Condition::new("Ready", ConditionStatus::True, "Allocated", "all network interfaces have port ranges")
        };

        let existing_conditions = gateway
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[]);
        let computed = NatGatewayStatus {
            ips: pool.iter().map(IpAddr::to_string).collect(),
            ports_used,
            requested_network_interfaces: targets.len() as u32,
            used_network_interfaces: used,
            conditions: merge_conditions(existing_conditions, vec![condition]),
        };
        metrics::set_nat_ports_used(&key.namespace, &key.name, ports_used);
        self.ctx
            .write_status(&gateway, gateway.status.as_ref(), &computed)
            .await?;
        Ok(Action::await_change())
    }
}
