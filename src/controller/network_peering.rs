//! Network Peering Controller
//!
//! Drives the two-way peering handshake between Networks. Each pass, for
//! every declared peering, a network may:
//!
//! - fill its own UID into the peer's back-reference, if that is still empty
//! - report the peering as `Bound` once both references carry UIDs
//! - record bound peers in its own `spec.peeringClaimRefs`
//!
//! It never edits any other field of the peer.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::indexes;
use super::reconciler::{Action, Context, Reconciler};
use super::router::{Scope, WatchSpec};
use crate::crd::{
    Network, NetworkPeering, NetworkPeeringStatus, NetworkStatus, PeeringClaimRef, PeeringState,
};
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{Kind, ObjectKey, StoreExt};
use crate::error::{Error, Result};
use crate::peering::{match_reference, MatchOutcome, Peer};

pub struct NetworkPeeringReconciler {
    ctx: Arc<Context>,
}

impl NetworkPeeringReconciler {
    pub const NAME: &'static str = "network-peering";

    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// A network is reconciled on its own changes and on changes of any
    /// network it references.
    pub fn watch_spec() -> WatchSpec {
        WatchSpec::new(Kind::Network).watches(
            Kind::Network,
            indexes::PEER,
            indexes::namespaced_name_of,
            Scope::AllNamespaces,
        )
    }

    async fn reconcile_peering(
        &self,
        network: &Network,
        peering: &NetworkPeering,
        bound: &mut BTreeSet<PeeringClaimRef>,
    ) -> Result<NetworkPeeringStatus> {
        let own = network.identity();
        let reference = network.resolve(&peering.network_ref);
        let mut peer = self
            .ctx
            .store
            .get_opt::<Network>(reference.namespace, reference.name)
            .await?;

        let mut outcome = match_reference(own, &reference, peer.as_ref());
        if let MatchOutcome::AssignUid { index, uid } = outcome.clone() {
            if let Some(current) = peer.as_ref() {
                let updated = self.assign_peer_uid(network, current, index, &uid).await?;
                outcome = match_reference(own, &reference, Some(&updated));
                peer = Some(updated);
            }
        }

        let status = match outcome {
            MatchOutcome::Bound { handle } => {
                if let Some(uid) = peer.as_ref().and_then(|p| p.meta().uid.clone()) {
                    bound.insert(PeeringClaimRef {
                        namespace: reference.namespace.to_string(),
                        name: reference.name.to_string(),
                        uid,
                    });
                }
                let was_bound = network
                    .peering_status(&peering.name)
                    .is_some_and(|s| s.state == PeeringState::Bound);
                if !was_bound {
                    info!(peering = %peering.name, peer = reference.name, "Peering bound");
                    self.ctx
                        .publish(ReconcileEvent::peering_bound(
                            own.namespace,
                            own.name,
                            &peering.name,
                            format!("{}/{}", reference.namespace, reference.name),
                        ))
                        .await;
                }
                NetworkPeeringStatus {
                    name: peering.name.clone(),
                    state: PeeringState::Bound,
                    network_handle: handle,
                    message: None,
                }
            }
            MatchOutcome::Pending(reason) => {
                debug!(peering = %peering.name, reason = %reason, "Peering pending");
                NetworkPeeringStatus {
                    name: peering.name.clone(),
                    state: PeeringState::Pending,
                    network_handle: None,
                    message: Some(reason.to_string()),
                }
            }
            MatchOutcome::AssignUid { .. } => NetworkPeeringStatus {
                name: peering.name.clone(),
                state: PeeringState::Pending,
                network_handle: None,
                message: Some("waiting for peer uid assignment".into()),
            },
        };
        Ok(status)
    }

    /// Write `uid` into the peer's reference at `index`.
    ///
    /// A merge patch cannot address one list element, so the peer's peerings
    /// are sent back whole with only that uid filled in. The write is pinned
    /// to the peer version that was read: if the peer changed in between, it
    /// fails with a conflict and nothing else in the list is overwritten.
    async fn assign_peer_uid(
        &self,
        network: &Network,
        peer: &Network,
        index: usize,
        uid: &str,
    ) -> Result<Network> {
        let key = ObjectKey::of(peer);
        let mut peerings = peer.spec.peerings.clone();
        let entry = peerings.get_mut(index).ok_or_else(|| {
            Error::Invariant(format!("{} has no peering at index {}", key, index))
        })?;
        if entry.network_ref.uid.is_some() {
            return Err(Error::Invariant(format!(
                "refusing to overwrite populated peer uid in {}",
                key
            )));
        }
        entry.network_ref.uid = Some(uid.to_string());

        let written = self
            .ctx
            .store
            .patch(
                &key,
                peer.meta().resource_version.as_deref(),
                &json!({ "spec": { "peerings": peerings } }),
            )
            .await?;

        let own = network.identity();
        info!(peer = %key, "Assigned own uid to peer reference");
        self.ctx
            .publish(ReconcileEvent::peer_uid_assigned(
                own.namespace,
                own.name,
                key.namespaced_name(),
            ))
            .await;
        written.into_typed()
    }
}

#[async_trait]
impl Reconciler for NetworkPeeringReconciler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> Kind {
        Kind::Network
    }

    #[instrument(skip(self), fields(network = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(network) = self
            .ctx
            .store
            .get_opt::<Network>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(Action::await_change());
        };
        if network.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let mut seen = HashSet::new();
        let duplicates: HashSet<&str> = network
            .spec
            .peerings
            .iter()
            .filter(|p| !seen.insert(p.name.as_str()))
            .map(|p| p.name.as_str())
            .collect();

        let mut statuses = Vec::with_capacity(network.spec.peerings.len());
        let mut bound = BTreeSet::new();
        let mut reported = HashSet::new();
        for peering in &network.spec.peerings {
            if duplicates.contains(peering.name.as_str()) {
                if reported.insert(peering.name.as_str()) {
                    statuses.push(NetworkPeeringStatus {
                        name: peering.name.clone(),
                        state: PeeringState::Error,
                        network_handle: None,
                        message: Some("duplicate peering name".into()),
                    });
                }
                continue;
            }
            statuses.push(self.reconcile_peering(&network, peering, &mut bound).await?);
        }

        let mut network = network.clone();
        let claim_refs: Vec<PeeringClaimRef> = bound.into_iter().collect();
        if claim_refs != network.spec.peering_claim_refs {
            let written = self
                .ctx
                .store
                .patch(
                    key,
                    network.metadata.resource_version.as_deref(),
                    &json!({ "spec": { "peeringClaimRefs": claim_refs } }),
                )
                .await?;
            network = written.into_typed()?;
        }

        let computed = NetworkStatus { peerings: statuses };
        self.ctx
            .write_status(&network, network.status.as_ref(), &computed)
            .await?;
        Ok(Action::await_change())
    }
}
