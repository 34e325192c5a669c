//! NetworkInterface Controller
//!
//! Materializes the interface's ephemeral children and claims its referenced
//! virtual IP:
//!
//! - `spec.ips[i].ephemeral` becomes a Prefix named `<nic>-<i>`
//! - `spec.virtualIp.ephemeral` becomes a VirtualIp named `<nic>`
//! - `spec.virtualIp.virtualIpRef` is claimed by writing the interface into
//!   the VirtualIp's `spec.targetRef`
//!
//! A finalizer is held while a referenced virtual IP is claimed, so the claim
//! is released before the interface goes away.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::indexes;
use super::reconciler::{Action, Context, Reconciler};
use super::router::{Scope, WatchSpec};
use crate::crd::{
    merge_conditions, parse_ip, ClaimRef, Condition, ConditionStatus, NetworkInterface,
    NetworkInterfaceState, NetworkInterfaceStatus, Prefix, VirtualIp,
};
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{Kind, Kinded, ListParams, ObjectKey, StoreExt};
use crate::error::{Error, Result};
use crate::ownership::{apply_ephemerals, child_metadata, is_controlled_by, EphemeralOutcome};
use crate::peering::{evaluate_claim, ClaimOutcome};

/// Held while the interface claims a referenced VirtualIp.
pub const VIRTUAL_IP_CLAIM_FINALIZER: &str = "networking.netorch.io/virtual-ip-claim";

/// Resolved state of the interface's virtual IP.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VirtualIpState {
    Unset,
    Ready(String),
    Pending(String),
}

pub struct NetworkInterfaceReconciler {
    ctx: Arc<Context>,
}

impl NetworkInterfaceReconciler {
    pub const NAME: &'static str = "network-interface";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn watch_spec() -> WatchSpec {
        WatchSpec::new(Kind::NetworkInterface)
            .owns(Kind::Prefix)
            .owns(Kind::VirtualIp)
            .watches(
                Kind::VirtualIp,
                indexes::VIRTUAL_IP,
                indexes::name_of,
                Scope::SameNamespace,
            )
            .watches(
                Kind::VirtualIp,
                indexes::UID,
                indexes::claimant_uid_of,
                Scope::SameNamespace,
            )
            .watches(
                Kind::Prefix,
                indexes::UID,
                indexes::claimant_uid_of,
                Scope::SameNamespace,
            )
    }

    async fn publish_children<C: Kinded>(&self, nic: &NetworkInterface, outcome: &EphemeralOutcome<C>) {
        let namespace = nic.namespace().unwrap_or_default();
        let parent = nic.name_any();
        for child in &outcome.created {
            self.ctx
                .publish(ReconcileEvent::child_created(C::KIND, &namespace, child.name_any(), &parent))
                .await;
        }
        for name in &outcome.deleted {
            self.ctx
                .publish(ReconcileEvent::child_deleted(C::KIND, &namespace, name, &parent))
                .await;
        }
        for name in &outcome.foreign {
            self.ctx
                .publish(ReconcileEvent::child_foreign(C::KIND, &namespace, name, &parent))
                .await;
        }
    }

    /// Create, keep or delete the ephemeral prefixes.
    async fn apply_prefixes(&self, nic: &NetworkInterface, uid: &str) -> Result<EphemeralOutcome<Prefix>> {
        let mut desired = BTreeMap::new();
        for (index, source) in nic.spec.ips.iter().enumerate() {
            let Some(ephemeral) = &source.ephemeral else {
                continue;
            };
            let name = nic.ephemeral_prefix_name(index);
            let template = &ephemeral.prefix_template;
            let mut spec = template.spec.clone();
            spec.claim_ref = Some(ClaimRef::new(nic.name_any(), uid));
            let metadata = child_metadata(nic, &name, &template.metadata, spec.reclaim_policy)?;
            desired.insert(
                name,
                Prefix {
                    metadata,
                    spec,
                    status: None,
                },
            );
        }

        let candidates = self.candidates::<Prefix>(nic, uid).await?;
        let outcome = apply_ephemerals(self.ctx.store.as_ref(), nic, desired, candidates, |p: &Prefix| {
            p.spec.claim_ref.as_ref().is_some_and(|c| c.uid == uid)
        })
        .await?;
        self.publish_children(nic, &outcome).await;
        Ok(outcome)
    }

    /// Create, keep or delete the ephemeral virtual IP.
    async fn apply_ephemeral_virtual_ip(
        &self,
        nic: &NetworkInterface,
        uid: &str,
    ) -> Result<EphemeralOutcome<VirtualIp>> {
        let mut desired = BTreeMap::new();
        if let Some(ephemeral) = nic.spec.virtual_ip.as_ref().and_then(|v| v.ephemeral.as_ref()) {
            let name = nic.ephemeral_virtual_ip_name();
            let template = &ephemeral.virtual_ip_template;
            let mut spec = template.spec.clone();
            spec.target_ref = Some(ClaimRef::new(nic.name_any(), uid));
            let metadata = child_metadata(nic, &name, &template.metadata, spec.reclaim_policy)?;
            desired.insert(
                name,
                VirtualIp {
                    metadata,
                    spec,
                    status: None,
                },
            );
        }

        let candidates = self.candidates::<VirtualIp>(nic, uid).await?;
        let outcome = apply_ephemerals(self.ctx.store.as_ref(), nic, desired, candidates, |v: &VirtualIp| {
            v.spec.target_ref.as_ref().is_some_and(|c| c.uid == uid)
        })
        .await?;
        self.publish_children(nic, &outcome).await;
        Ok(outcome)
    }

    /// Existing children of the interface: those it controls plus those that
    /// carry its claim, which covers retained children.
    async fn candidates<C: Kinded>(&self, nic: &NetworkInterface, uid: &str) -> Result<Vec<C>> {
        let namespace = nic.namespace().unwrap_or_default();
        let mut children = self
            .ctx
            .store
            .list_typed::<C>(&ListParams::namespaced(&namespace).field(indexes::OWNER_UID, uid))
            .await?;
        children.extend(
            self.ctx
                .store
                .list_typed::<C>(&ListParams::namespaced(&namespace).field(indexes::CLAIM_UID, uid))
                .await?,
        );
        Ok(children)
    }

    /// Claim the referenced VirtualIp `name`.
    async fn claim_virtual_ip(&self, nic: &NetworkInterface, uid: &str, name: &str) -> Result<VirtualIpState> {
        let namespace = nic.namespace().unwrap_or_default();
        let Some(vip) = self.ctx.store.get_opt::<VirtualIp>(&namespace, name).await? else {
            return Ok(VirtualIpState::Pending(format!("virtual IP {} not found", name)));
        };

        let vip = match evaluate_claim(uid, vip.spec.target_ref.as_ref()) {
            ClaimOutcome::Taken => {
                let holder = vip.spec.target_ref.as_ref().map(|c| c.name.clone()).unwrap_or_default();
                return Ok(VirtualIpState::Pending(format!(
                    "virtual IP {} is claimed by {}",
                    name, holder
                )));
            }
            ClaimOutcome::Bound => vip,
            ClaimOutcome::Claim => {
                let written = self
                    .ctx
                    .store
                    .patch(
                        &ObjectKey::of(&vip),
                        vip.meta().resource_version.as_deref(),
                        &json!({ "spec": { "targetRef": ClaimRef::new(nic.name_any(), uid) } }),
                    )
                    .await?;
                info!(virtual_ip = name, "Claimed virtual IP");
                self.ctx
                    .publish(ReconcileEvent::resource_claimed(
                        Kind::VirtualIp,
                        &namespace,
                        name,
                        nic.name_any(),
                    ))
                    .await;
                written.into_typed()?
            }
        };

        Ok(match vip.allocated() {
            Some(ip) => VirtualIpState::Ready(ip.to_string()),
            None => VirtualIpState::Pending(format!("virtual IP {} not allocated", name)),
        })
    }

    /// Release every VirtualIp claimed by this interface except `keep` and
    /// its own controlled children.
    async fn release_claims(&self, nic: &NetworkInterface, uid: &str, keep: Option<&str>) -> Result<()> {
        let namespace = nic.namespace().unwrap_or_default();
        let claimed = self
            .ctx
            .store
            .list_typed::<VirtualIp>(&ListParams::namespaced(&namespace).field(indexes::CLAIM_UID, uid))
            .await?;

        for vip in claimed {
            let name = vip.name_any();
            if Some(name.as_str()) == keep || is_controlled_by(vip.meta(), nic.meta()) {
                continue;
            }
            match self
                .ctx
                .store
                .patch(
                    &ObjectKey::of(&vip),
                    vip.meta().resource_version.as_deref(),
                    &json!({ "spec": { "targetRef": null } }),
                )
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
            info!(virtual_ip = %name, "Released virtual IP claim");
            self.ctx
                .publish(ReconcileEvent::resource_released(Kind::VirtualIp, &namespace, &name, uid))
                .await;
        }
        Ok(())
    }

    async fn set_finalizer(&self, nic: NetworkInterface, present: bool) -> Result<NetworkInterface> {
        let finalizers = nic.finalizers();
        let has = finalizers.iter().any(|f| f == VIRTUAL_IP_CLAIM_FINALIZER);
        if has == present {
            return Ok(nic);
        }

        let mut updated: Vec<String> = finalizers
            .iter()
            .filter(|f| *f != VIRTUAL_IP_CLAIM_FINALIZER)
            .cloned()
            .collect();
        if present {
            updated.push(VIRTUAL_IP_CLAIM_FINALIZER.to_string());
        }
        debug!(present, "Updating claim finalizer");
        let written = self
            .ctx
            .store
            .patch(
                &ObjectKey::of(&nic),
                nic.meta().resource_version.as_deref(),
                &json!({ "metadata": { "finalizers": updated } }),
            )
            .await?;
        written.into_typed()
    }

    async fn finalize(&self, nic: NetworkInterface, uid: &str) -> Result<Action> {
        if nic.finalizers().iter().any(|f| f == VIRTUAL_IP_CLAIM_FINALIZER) {
            self.release_claims(&nic, uid, None).await?;
            self.set_finalizer(nic, false).await?;
        }
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for NetworkInterfaceReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> Kind {
        Kind::NetworkInterface
    }

    #[instrument(skip(self), fields(nic = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(nic) = self
            .ctx
            .store
            .get_opt::<NetworkInterface>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(Action::await_change());
        };
        let uid = nic
            .uid()
            .ok_or_else(|| Error::Invariant(format!("{} has no uid", key)))?;

        if nic.meta().deletion_timestamp.is_some() {
            return self.finalize(nic, &uid).await;
        }

        // IPs
        let prefixes = self.apply_prefixes(&nic, &uid).await?;
        let mut ips = Vec::new();
        let mut pending = Vec::new();
        let mut invalid = Vec::new();
        for (index, source) in nic.spec.ips.iter().enumerate() {
            match (&source.value, &source.ephemeral) {
                (Some(value), None) => match parse_ip(value) {
                    Some(ip) => ips.push(ip.to_string()),
                    None => invalid.push(format!("spec.ips[{}]: invalid address {}", index, value)),
                },
                (None, Some(_)) => {
                    let name = nic.ephemeral_prefix_name(index);
                    match prefixes.child(&name).and_then(|p| p.allocated()).and_then(parse_ip) {
                        Some(ip) => ips.push(ip.to_string()),
                        None => pending.push(format!("prefix {} not allocated", name)),
                    }
                }
                _ => invalid.push(format!(
                    "spec.ips[{}]: exactly one of value and ephemeral must be set",
                    index
                )),
            }
        }

        // Virtual IP
        let ephemeral_vips = self.apply_ephemeral_virtual_ip(&nic, &uid).await?;
        let source = nic.spec.virtual_ip.clone();
        let (nic, virtual_ip) = match source {
            None => {
                self.release_claims(&nic, &uid, None).await?;
                (self.set_finalizer(nic, false).await?, VirtualIpState::Unset)
            }
            Some(source) => match (source.virtual_ip_ref, source.ephemeral) {
                (Some(reference), None) => {
                    let nic = self.set_finalizer(nic, true).await?;
                    self.release_claims(&nic, &uid, Some(&reference.name)).await?;
                    let state = self.claim_virtual_ip(&nic, &uid, &reference.name).await?;
                    (nic, state)
                }
                (None, Some(_)) => {
                    let name = nic.ephemeral_virtual_ip_name();
                    self.release_claims(&nic, &uid, Some(&name)).await?;
                    let nic = self.set_finalizer(nic, false).await?;
                    let state = match ephemeral_vips.child(&name).and_then(|v| v.allocated()) {
                        Some(ip) => VirtualIpState::Ready(ip.to_string()),
                        None => VirtualIpState::Pending(format!("virtual IP {} not allocated", name)),
                    };
                    (nic, state)
                }
                _ => {
                    invalid.push(
                        "spec.virtualIp: exactly one of virtualIpRef and ephemeral must be set".into(),
                    );
                    (nic, VirtualIpState::Unset)
                }
            },
        };

        // Status
        let virtual_ip_value = match &virtual_ip {
            VirtualIpState::Ready(ip) => Some(ip.clone()),
            _ => None,
        };
        if let VirtualIpState::Pending(reason) = virtual_ip {
            pending.push(reason);
        }

        let (state, condition) = if !invalid.is_empty() {
            warn!(errors = ?invalid, "Invalid interface spec");
            (
                NetworkInterfaceState::Error,
                Condition::new("Ready", ConditionStatus::False, "InvalidSpec", invalid.join("; ")),
            )
        } else if !pending.is_empty() {
            (
                NetworkInterfaceState::Pending,
                Condition::new("Ready", ConditionStatus::False, "Pending", pending.join("; ")),
            )
        } else {
            (
                NetworkInterfaceState::Available,
                Condition::new("Ready", ConditionStatus::True, "Available", "all addresses assigned"),
            )
        };

        let existing = nic.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[]);
        let computed = NetworkInterfaceStatus {
            state,
            ips,
            virtual_ip: virtual_ip_value,
            conditions: merge_conditions(existing, vec![condition]),
        };
        self.ctx
            .write_status(&nic, nic.status.as_ref(), &computed)
            .await?;
        Ok(Action::await_change())
    }
}
