//! Ephemeral Children
//!
//! A parent declares a set of children by name; this module makes the store
//! match that set. Children controlled by the parent are kept or deleted,
//! missing ones are created. Objects the parent does not control are never
//! modified, even when their name collides with a desired child.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{is_controlled_by, set_controller_reference};
use crate::crd::{ReclaimPolicy, TemplateMetadata};
use crate::domain::ports::{Kinded, ObjectKey, ObjectStore, StoreExt};
use crate::error::{Error, Result};

/// Result of one [`apply_ephemerals`] call.
#[derive(Debug, Clone)]
pub struct EphemeralOutcome<C> {
    /// Children created in this call.
    pub created: Vec<C>,
    /// Controlled children that were already present and desired.
    pub kept: Vec<C>,
    /// Names of controlled children deleted because they are no longer desired.
    pub deleted: Vec<String>,
    /// Names of desired children occupied by objects this parent does not control.
    pub foreign: Vec<String>,
}

impl<C> Default for EphemeralOutcome<C> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            kept: Vec::new(),
            deleted: Vec::new(),
            foreign: Vec::new(),
        }
    }
}

impl<C: Kinded> EphemeralOutcome<C> {
    /// The live controlled child with this name, if any.
    pub fn child(&self, name: &str) -> Option<&C> {
        self.created
            .iter()
            .chain(self.kept.iter())
            .find(|c| c.name_any() == name)
    }

    pub fn is_foreign(&self, name: &str) -> bool {
        self.foreign.iter().any(|n| n == name)
    }
}

/// Metadata for a child instantiated from a template.
///
/// `Retain` children get no owner reference, so deleting the parent leaves
/// them in place.
pub fn child_metadata<P: Kinded>(
    owner: &P,
    name: &str,
    template: &TemplateMetadata,
    reclaim: ReclaimPolicy,
) -> Result<ObjectMeta> {
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace(),
        labels: (!template.labels.is_empty()).then(|| template.labels.clone()),
        annotations: (!template.annotations.is_empty()).then(|| template.annotations.clone()),
        ..Default::default()
    };

    if reclaim == ReclaimPolicy::Delete {
        set_controller_reference(&mut meta, owner)?;
    }
    Ok(meta)
}

/// Reconcile the children of `owner` against `desired`.
///
/// `candidates` are the existing children to consider, typically selected by
/// an owner index. A create that races with another writer re-reads the
/// object and classifies it like any other existing child.
///
/// `claimed` recognizes children the owner holds without a controller
/// reference, such as retained ones. They are kept while desired and left in
/// place once they are not.
pub async fn apply_ephemerals<P, C, F>(
    store: &dyn ObjectStore,
    owner: &P,
    desired: BTreeMap<String, C>,
    candidates: Vec<C>,
    claimed: F,
) -> Result<EphemeralOutcome<C>>
where
    P: Kinded,
    C: Kinded,
    F: Fn(&C) -> bool + Sync,
{
    let parent = ObjectKey::of(owner);
    let mut outcome = EphemeralOutcome::default();
    let mut handled = BTreeSet::new();

    for child in candidates {
        let name = child.name_any();
        if !handled.insert(name.clone()) {
            continue;
        }

        let controlled = is_controlled_by(child.meta(), owner.meta());
        if !controlled && !claimed(&child) {
            if desired.contains_key(&name) {
                warn!(parent = %parent, child = %name, kind = %C::KIND, "Child name taken by foreign object");
                outcome.foreign.push(name);
            }
            continue;
        }

        if desired.contains_key(&name) {
            outcome.kept.push(child);
        } else if !controlled {
            debug!(parent = %parent, child = %name, "Leaving undesired claimed child");
        } else if child.meta().deletion_timestamp.is_some() {
            debug!(parent = %parent, child = %name, "Undesired child already terminating");
        } else {
            match store.delete(&ObjectKey::of(&child)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            info!(parent = %parent, child = %name, kind = %C::KIND, "Deleted undesired child");
            outcome.deleted.push(name);
        }
    }

    for (name, child) in desired {
        if handled.contains(&name) {
            continue;
        }

        match store.create_typed(child).await {
            Ok(created) => {
                info!(parent = %parent, child = %name, kind = %C::KIND, "Created child");
                outcome.created.push(created);
            }
            Err(e) if e.is_already_exists() => {
                let namespace = parent.namespace.as_str();
                let existing = store
                    .get_opt::<C>(namespace, &name)
                    .await?
                    .ok_or_else(|| Error::conflict(ObjectKey::new(C::KIND, namespace, &name)))?;

                if is_controlled_by(existing.meta(), owner.meta()) || claimed(&existing) {
                    debug!(parent = %parent, child = %name, "Adopted concurrently created child");
                    outcome.kept.push(existing);
                } else {
                    warn!(parent = %parent, child = %name, kind = %C::KIND, "Child name taken by foreign object");
                    outcome.foreign.push(name);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::crd::{ClaimRef, Network, NetworkSpec, Prefix, PrefixSpec};

    async fn owner(store: &MemoryStore) -> Network {
        let network = Network {
            metadata: ObjectMeta {
                name: Some("parent".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            spec: NetworkSpec::default(),
            status: None,
        };
        store.create_typed(network).await.unwrap()
    }

    fn unclaimed(_: &Prefix) -> bool {
        false
    }

    fn claimed_by(uid: &str) -> impl Fn(&Prefix) -> bool + Sync + '_ {
        move |prefix| prefix.spec.claim_ref.as_ref().is_some_and(|c| c.uid == uid)
    }

    fn desired_prefix(owner: &Network, name: &str, reclaim: ReclaimPolicy) -> Prefix {
        Prefix {
            metadata: child_metadata(owner, name, &TemplateMetadata::default(), reclaim).unwrap(),
            spec: PrefixSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_creates_missing_children() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;

        let desired: BTreeMap<_, _> = ["parent-0", "parent-1"]
            .into_iter()
            .map(|n| (n.to_string(), desired_prefix(&parent, n, ReclaimPolicy::Delete)))
            .collect();

        let outcome = apply_ephemerals(&store, &parent, desired, vec![], unclaimed)
            .await
            .unwrap();
        assert_eq!(outcome.created.len(), 2);
        assert!(outcome.child("parent-1").is_some());

        let stored: Prefix = store.get_typed("ns", "parent-0").await.unwrap();
        assert!(is_controlled_by(&stored.metadata, &parent.metadata));
    }

    #[tokio::test]
    async fn test_deletes_undesired_controlled_child() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;
        let stale = store
            .create_typed(desired_prefix(&parent, "parent-9", ReclaimPolicy::Delete))
            .await
            .unwrap();

        let outcome = apply_ephemerals(&store, &parent, BTreeMap::<String, Prefix>::new(), vec![stale], unclaimed)
            .await
            .unwrap();
        assert_eq!(outcome.deleted, vec!["parent-9".to_string()]);
        assert!(store.get_opt::<Prefix>("ns", "parent-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_collision_untouched() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;
        let foreign = store
            .create_typed(Prefix {
                metadata: ObjectMeta {
                    name: Some("parent-0".into()),
                    namespace: Some("ns".into()),
                    ..Default::default()
                },
                spec: PrefixSpec::default(),
                status: None,
            })
            .await
            .unwrap();

        let desired: BTreeMap<_, _> =
            [("parent-0".to_string(), desired_prefix(&parent, "parent-0", ReclaimPolicy::Delete))].into();

        // Not in candidates: discovered through the create race path.
        let outcome = apply_ephemerals(&store, &parent, desired.clone(), vec![], unclaimed)
            .await
            .unwrap();
        assert!(outcome.is_foreign("parent-0"));

        // In candidates: classified directly.
        let outcome = apply_ephemerals(&store, &parent, desired, vec![foreign.clone()], unclaimed)
            .await
            .unwrap();
        assert!(outcome.is_foreign("parent-0"));

        let stored: Prefix = store.get_typed("ns", "parent-0").await.unwrap();
        assert!(stored.metadata.owner_references.is_none());
        assert_eq!(stored.metadata.resource_version, foreign.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_retain_child_has_no_owner() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;

        let child = desired_prefix(&parent, "parent-0", ReclaimPolicy::Retain);
        assert!(child.metadata.owner_references.is_none());
        assert_eq!(child.metadata.namespace.as_deref(), Some("ns"));
    }

    #[tokio::test]
    async fn test_claimed_retain_child_kept() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;
        let uid = parent.metadata.uid.clone().unwrap();

        let mut child = desired_prefix(&parent, "parent-0", ReclaimPolicy::Retain);
        child.spec.claim_ref = Some(ClaimRef::new("parent", &uid));
        let desired: BTreeMap<_, _> = [("parent-0".to_string(), child)].into();

        let first = apply_ephemerals(&store, &parent, desired.clone(), vec![], claimed_by(&uid))
            .await
            .unwrap();
        assert_eq!(first.created.len(), 1);
        let stored: Prefix = store.get_typed("ns", "parent-0").await.unwrap();

        // Found by claim on later passes: kept, never recreated or reported foreign.
        let second = apply_ephemerals(&store, &parent, desired, vec![stored.clone()], claimed_by(&uid))
            .await
            .unwrap();
        assert_eq!(second.kept.len(), 1);
        assert!(second.created.is_empty());
        assert!(second.foreign.is_empty());

        // No longer desired: left in place.
        let third = apply_ephemerals(
            &store,
            &parent,
            BTreeMap::new(),
            vec![stored.clone()],
            claimed_by(&uid),
        )
        .await
        .unwrap();
        assert!(third.deleted.is_empty());
        let after: Prefix = store.get_typed("ns", "parent-0").await.unwrap();
        assert_eq!(after.metadata.resource_version, stored.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_claimed_child_found_on_create_race() {
        let store = MemoryStore::new();
        let parent = owner(&store).await;
        let uid = parent.metadata.uid.clone().unwrap();

        let mut child = desired_prefix(&parent, "parent-0", ReclaimPolicy::Retain);
        child.spec.claim_ref = Some(ClaimRef::new("parent", &uid));
        store.create_typed(child.clone()).await.unwrap();

        let desired: BTreeMap<_, _> = [("parent-0".to_string(), child)].into();
        let outcome = apply_ephemerals(&store, &parent, desired, vec![], claimed_by(&uid))
            .await
            .unwrap();
        assert!(outcome.child("parent-0").is_some());
        assert!(!outcome.is_foreign("parent-0"));
    }
}
