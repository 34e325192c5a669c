//! LoadBalancer Controller
//!
//! Keeps a LoadBalancerRouting, named like the load balancer and controlled
//! by it, listing every selected interface address of a served IP family.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::indexes;
use super::reconciler::{Action, Context, Reconciler};
use super::router::{Scope, WatchSpec};
use crate::crd::{
    merge_conditions, parse_ip, Condition, ConditionStatus, IpFamily, LoadBalancer,
    LoadBalancerDestination, LoadBalancerRouting, LoadBalancerRoutingSpec, LoadBalancerStatus,
    NetworkInterface,
};
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{Kind, ListParams, ObjectKey, StoreExt};
use crate::error::Result;
use crate::ownership::{is_controlled_by, set_controller_reference};

pub struct LoadBalancerReconciler {
    ctx: Arc<Context>,
}

impl LoadBalancerReconciler {
    pub const NAME: &'static str = "load-balancer";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn watch_spec() -> WatchSpec {
        WatchSpec::new(Kind::LoadBalancer)
            .owns(Kind::LoadBalancerRouting)
            .watches(
                Kind::NetworkInterface,
                indexes::NETWORK,
                indexes::network_of,
                Scope::SameNamespace,
            )
    }

    /// Interfaces of the load balancer's network matched by its selector.
    async fn targets(&self, lb: &LoadBalancer) -> Result<Vec<NetworkInterface>> {
        let Some(selector) = &lb.spec.network_interface_selector else {
            return Ok(Vec::new());
        };
        let params = ListParams::namespaced(lb.namespace().unwrap_or_default())
            .field(indexes::NETWORK, &lb.spec.network_ref.name);
        let nics = self.ctx.store.list_typed::<NetworkInterface>(&params).await?;
        Ok(nics
            .into_iter()
            .filter(|nic| nic.meta().deletion_timestamp.is_none())
            .filter(|nic| selector.matches(nic.labels()))
            .collect())
    }
}

/// Destinations for `targets`, sorted.
pub fn destinations(lb: &LoadBalancer, targets: &[NetworkInterface]) -> Vec<LoadBalancerDestination> {
    let mut destinations: Vec<LoadBalancerDestination> = targets
        .iter()
        .flat_map(|nic| {
            nic.status_ips().iter().filter_map(move |value| {
                let ip = parse_ip(value)?;
                if !lb.serves_family(IpFamily::of(&ip)) {
                    return None;
                }
                Some(LoadBalancerDestination {
                    uid: nic.metadata.uid.clone().unwrap_or_default(),
                    name: nic.name_any(),
                    ip: ip.to_string(),
                    provider_id: nic.spec.provider_id.clone(),
                })
            })
        })
        .collect();
    destinations.sort();
    destinations.dedup();
    destinations
}

#[async_trait]
impl Reconciler for LoadBalancerReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> Kind {
        Kind::LoadBalancer
    }

    #[instrument(skip(self), fields(lb = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(lb) = self
            .ctx
            .store
            .get_opt::<LoadBalancer>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(Action::await_change());
        };
        if lb.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let targets = self.targets(&lb).await?;
        let destinations = destinations(&lb, &targets);
        let spec = LoadBalancerRoutingSpec {
            network_ref: lb.spec.network_ref.clone(),
            destinations,
        };
        let count = spec.destinations.len() as u32;

        let routing_key = ObjectKey::new(Kind::LoadBalancerRouting, &key.namespace, &key.name);
        let existing = self
            .ctx
            .store
            .get_opt::<LoadBalancerRouting>(&key.namespace, &key.name)
            .await?;

        let condition = match existing {
            None => {
                let mut metadata = kube::api::ObjectMeta {
                    name: Some(key.name.clone()),
                    namespace: Some(key.namespace.clone()),
                    ..Default::default()
                };
                set_controller_reference(&mut metadata, &lb)?;
                match self
                    .ctx
                    .store
                    .create_typed(LoadBalancerRouting { metadata, spec })
                    .await
                {
                    Ok(_) => {
                        info!(destinations = count, "Created routing");
                        self.ctx
                            .publish(ReconcileEvent::child_created(
                                Kind::LoadBalancerRouting,
                                &key.namespace,
                                &key.name,
                                &key.name,
                            ))
                            .await;
                    }
                    // Raced with another writer; the next pass sees it.
                    Err(e) if e.is_already_exists() => return Err(crate::error::Error::conflict(routing_key)),
                    Err(e) => return Err(e),
                }
                Condition::new("Ready", ConditionStatus::True, "RoutingUpdated", "routing is up to date")
            }
            Some(routing) if !is_controlled_by(routing.meta(), lb.meta()) => {
                warn!(routing = %routing_key, "Routing object not controlled by load balancer");
                self.ctx
                    .publish(ReconcileEvent::child_foreign(
                        Kind::LoadBalancerRouting,
                        &key.namespace,
                        &key.name,
                        &key.name,
                    ))
                    .await;
                Condition::new(
                    "Ready",
                    ConditionStatus::False,
                    "RoutingConflict",
                    "routing object exists and is not controlled by this load balancer",
                )
            }
            Some(routing) => {
                if routing.spec != spec {
                    self.ctx
                        .store
                        .patch(
                            &routing_key,
                            routing.meta().resource_version.as_deref(),
                            &json!({ "spec": spec }),
                        )
                        .await?;
                    info!(destinations = count, "Updated routing");
                } else {
                    debug!("Routing unchanged");
                }
                Condition::new("Ready", ConditionStatus::True, "RoutingUpdated", "routing is up to date")
            }
        };

        let existing_conditions = lb.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[]);
        let computed = LoadBalancerStatus {
            ips: lb.spec.ips.clone(),
            destination_count: count,
            conditions: merge_conditions(existing_conditions, vec![condition]),
        };
        self.ctx.write_status(&lb, lb.status.as_ref(), &computed).await?;
        Ok(Action::await_change())
    }
}
