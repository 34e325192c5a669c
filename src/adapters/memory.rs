//! In-Process Object Store Adapter
//!
//! Implements the `ObjectStore` port entirely in memory. It honours the same
//! client-visible contract as an API server: server-assigned UIDs, version
//! tokens bumped on every effective write, JSON merge patches, finalizer-gated
//! deletion, garbage collection of dependents through owner references and
//! per-kind watch streams.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::domain::ports::{
    IndexFn, Kind, ListParams, Object, ObjectKey, ObjectStore, WatchEvent, WatchEventKind,
    WatchStream,
};
use crate::error::{Error, Result};

/// Buffered events per kind before slow watchers start lagging.
const WATCH_BUFFER: usize = 1024;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Object>,
    last_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

/// Object store held in process memory.
pub struct MemoryStore {
    state: RwLock<State>,
    indexes: DashMap<(Kind, String), IndexFn>,
    watchers: HashMap<Kind, broadcast::Sender<WatchEvent>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let watchers = Kind::ALL
            .iter()
            .map(|kind| (*kind, broadcast::channel(WATCH_BUFFER).0))
            .collect();

        Self {
            state: RwLock::new(State::default()),
            indexes: DashMap::new(),
            watchers,
        }
    }

    /// Number of stored objects of a kind, including terminating ones.
    pub fn count(&self, kind: Kind) -> usize {
        self.state
            .read()
            .objects
            .keys()
            .filter(|k| k.kind == kind)
            .count()
    }

    fn emit(&self, events: Vec<WatchEvent>) {
        for event in events {
            if let Some(tx) = self.watchers.get(&event.object.kind()) {
                // No receivers is fine.
                let _ = tx.send(event);
            }
        }
    }

    fn index_values(&self, kind: Kind, index: &str, object: &Object) -> Result<Vec<String>> {
        let entry = self
            .indexes
            .get(&(kind, index.to_string()))
            .ok_or_else(|| Error::Invariant(format!("no index {} registered for {}", index, kind)))?;
        Ok((entry.value())(object))
    }

    /// Apply a merge patch to `key`, restricted to status or to everything else.
    fn apply_patch(
        &self,
        key: &ObjectKey,
        version: Option<&str>,
        doc: &Value,
        status_only: bool,
    ) -> Result<Object> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.write();
            let current = state
                .objects
                .get(key)
                .ok_or_else(|| Error::not_found(key))?
                .clone();

            if let Some(version) = version {
                if current.resource_version() != Some(version) {
                    return Err(Error::conflict(key));
                }
            }

            let doc = scope_patch(doc, status_only);
            let before = current.to_value()?;
            let mut after = before.clone();
            merge_patch(&mut after, &doc);
            if after == before {
                return Ok(current);
            }

            let mut updated = Object::from_value(key.kind, after)?;
            preserve_server_fields(updated.meta_mut(), current.meta());
            check_single_controller(&updated)?;
            updated.meta_mut().resource_version = Some(state.next_version());

            let finalized = updated.is_terminating()
                && updated
                    .meta()
                    .finalizers
                    .as_ref()
                    .map_or(true, |f| f.is_empty());

            if finalized {
                remove_cascading(&mut state, key, &mut events);
            } else {
                state.objects.insert(key.clone(), updated.clone());
                events.push(WatchEvent {
                    kind: WatchEventKind::Modified,
                    object: updated.clone(),
                });
            }
            updated
        };

        trace!(key = %key, version = ?result.resource_version(), "Patched object");
        self.emit(events);
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("objects", &state.objects.len())
            .field("last_version", &state.last_version)
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Object> {
        self.state
            .read()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    async fn list(&self, kind: Kind, params: &ListParams) -> Result<Vec<Object>> {
        let candidates: Vec<Object> = self
            .state
            .read()
            .objects
            .iter()
            .filter(|(k, o)| k.kind == kind && params.matches_meta(o.meta()))
            .map(|(_, o)| o.clone())
            .collect();

        match &params.field {
            None => Ok(candidates),
            Some(field) => {
                let mut selected = Vec::with_capacity(candidates.len());
                for object in candidates {
                    if self
                        .index_values(kind, &field.index, &object)?
                        .contains(&field.value)
                    {
                        selected.push(object);
                    }
                }
                Ok(selected)
            }
        }
    }

    async fn watch(&self, kind: Kind) -> Result<WatchStream> {
        let rx = self
            .watchers
            .get(&kind)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::Invariant(format!("no watch channel for {}", kind)))?;

        let stream = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(Error::Transient(format!("watch lagged by {} events", missed))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }

    async fn create(&self, mut object: Object) -> Result<Object> {
        let key = object.key();
        if key.name.is_empty() {
            return Err(Error::Validation(format!("{} object has no name", key.kind)));
        }
        check_single_controller(&object)?;

        let created = {
            let mut state = self.state.write();
            if state.objects.contains_key(&key) {
                return Err(Error::already_exists(&key));
            }

            let version = state.next_version();
            let meta = object.meta_mut();
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.resource_version = Some(version);
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
            meta.generation = Some(1);

            state.objects.insert(key.clone(), object.clone());
            object
        };

        debug!(key = %key, uid = ?created.uid(), "Created object");
        self.emit(vec![WatchEvent {
            kind: WatchEventKind::Added,
            object: created.clone(),
        }]);
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, version: Option<&str>, doc: &Value) -> Result<Object> {
        self.apply_patch(key, version, doc, false)
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        version: Option<&str>,
        doc: &Value,
    ) -> Result<Object> {
        self.apply_patch(key, version, doc, true)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let current = state
                .objects
                .get(key)
                .ok_or_else(|| Error::not_found(key))?;

            let has_finalizers = current
                .meta()
                .finalizers
                .as_ref()
                .is_some_and(|f| !f.is_empty());

            if has_finalizers {
                if !current.is_terminating() {
                    let mut marked = current.clone();
                    let version = state.next_version();
                    let meta = marked.meta_mut();
                    meta.deletion_timestamp = Some(Time(Utc::now()));
                    meta.resource_version = Some(version);
                    state.objects.insert(key.clone(), marked.clone());
                    events.push(WatchEvent {
                        kind: WatchEventKind::Modified,
                        object: marked,
                    });
                }
            } else {
                remove_cascading(&mut state, key, &mut events);
            }
        }

        debug!(key = %key, events = events.len(), "Deleted object");
        self.emit(events);
        Ok(())
    }

    fn register_index(&self, kind: Kind, name: &str, index: IndexFn) -> Result<()> {
        self.indexes.insert((kind, name.to_string()), index);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Apply an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Keep only `status` for status patches and drop it otherwise.
fn scope_patch(doc: &Value, status_only: bool) -> Value {
    let Value::Object(map) = doc else {
        return Value::Object(serde_json::Map::new());
    };

    let scoped = map
        .iter()
        .filter(|(k, _)| (k.as_str() == "status") == status_only)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(scoped)
}

fn preserve_server_fields(meta: &mut ObjectMeta, current: &ObjectMeta) {
    meta.name = current.name.clone();
    meta.namespace = current.namespace.clone();
    meta.uid = current.uid.clone();
    meta.creation_timestamp = current.creation_timestamp.clone();
    meta.deletion_timestamp = current.deletion_timestamp.clone();
    meta.generation = current.generation;
}

fn check_single_controller(object: &Object) -> Result<()> {
    let controllers = object
        .meta()
        .owner_references
        .as_ref()
        .map_or(0, |refs| refs.iter().filter(|r| r.controller == Some(true)).count());

    if controllers > 1 {
        return Err(Error::AlreadyControlled {
            child: object.key().to_string(),
            owner: "multiple controllers".into(),
        });
    }
    Ok(())
}

/// Remove `key` and garbage-collect dependents left without a live owner.
fn remove_cascading(state: &mut State, key: &ObjectKey, events: &mut Vec<WatchEvent>) {
    let mut pending = vec![key.clone()];

    while let Some(next) = pending.pop() {
        let Some(removed) = state.objects.remove(&next) else {
            continue;
        };
        let removed_uid = removed.uid().map(str::to_string);
        events.push(WatchEvent {
            kind: WatchEventKind::Deleted,
            object: removed,
        });

        let Some(removed_uid) = removed_uid else {
            continue;
        };

        let live_uids: Vec<String> = state
            .objects
            .values()
            .filter_map(|o| o.uid().map(str::to_string))
            .collect();

        let orphans: Vec<ObjectKey> = state
            .objects
            .values()
            .filter(|o| {
                let refs = o.meta().owner_references.as_deref().unwrap_or_default();
                refs.iter().any(|r| r.uid == removed_uid)
                    && !refs.iter().any(|r| live_uids.contains(&r.uid))
            })
            .map(Object::key)
            .collect();

        for orphan in orphans {
            let has_finalizers = state
                .objects
                .get(&orphan)
                .and_then(|o| o.meta().finalizers.as_ref())
                .is_some_and(|f| !f.is_empty());

            if has_finalizers {
                let version = state.next_version();
                if let Some(object) = state.objects.get_mut(&orphan) {
                    if object.is_terminating() {
                        continue;
                    }
                    let meta = object.meta_mut();
                    meta.deletion_timestamp = Some(Time(Utc::now()));
                    meta.resource_version = Some(version);
                    events.push(WatchEvent {
                        kind: WatchEventKind::Modified,
                        object: object.clone(),
                    });
                }
            } else {
                pending.push(orphan);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClaimRef, Network, NetworkSpec, Prefix, PrefixSpec, VirtualIp, VirtualIpSpec,
    };
    use crate::domain::ports::{Kinded, StoreExt};
    use crate::ownership::set_controller_reference;
    use assert_matches::assert_matches;
    use kube::Resource;
    use serde_json::json;
    use std::sync::Arc;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            ..Default::default()
        }
    }

    fn network(name: &str) -> Network {
        Network {
            metadata: meta(name),
            spec: NetworkSpec::default(),
            status: None,
        }
    }

    fn prefix(name: &str) -> Prefix {
        Prefix {
            metadata: meta(name),
            spec: PrefixSpec::default(),
            status: None,
        }
    }

    // =========================================================================
    // Create / Get
    // =========================================================================

    #[tokio::test]
    async fn test_create_assigns_uid_and_version() {
        let store = MemoryStore::new();
        let created = store.create_typed(network("a")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let fetched: Network = store.get_typed("ns", "a").await.unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = MemoryStore::new();
        store.create_typed(network("a")).await.unwrap();

        let err = store.create_typed(network("a")).await.unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_typed::<Network>("ns", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_opt::<Network>("ns", "missing").await.unwrap().is_none());
    }

    // =========================================================================
    // Patch
    // =========================================================================

    #[tokio::test]
    async fn test_patch_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create_typed(network("a")).await.unwrap();
        let key = ObjectKey::of(&created);
        let version = created.metadata.resource_version.clone();

        store
            .patch(&key, version.as_deref(), &json!({"spec": {"providerId": "p1"}}))
            .await
            .unwrap();

        let err = store
            .patch(&key, version.as_deref(), &json!({"spec": {"providerId": "p2"}}))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict { .. });
    }

    #[tokio::test]
    async fn test_noop_patch_keeps_version() {
        let store = MemoryStore::new();
        let created = store.create_typed(network("a")).await.unwrap();
        let key = ObjectKey::of(&created);

        let patched = store
            .patch(&key, None, &json!({"spec": {"peerings": []}}))
            .await
            .unwrap();
        assert_eq!(patched.resource_version(), created.metadata.resource_version.as_deref());
    }

    #[tokio::test]
    async fn test_patch_ignores_status_and_patch_status_ignores_spec() {
        let store = MemoryStore::new();
        let created = store.create_typed(network("a")).await.unwrap();
        let key = ObjectKey::of(&created);

        let patched: Network = store
            .patch(
                &key,
                None,
                &json!({"spec": {"providerId": "p1"}, "status": {"peerings": [{"name": "x", "state": "Bound"}]}}),
            )
            .await
            .unwrap()
            .into_typed()
            .unwrap();
        assert_eq!(patched.spec.provider_id.as_deref(), Some("p1"));
        assert!(patched.status.is_none());

        let patched: Network = store
            .patch_status(
                &key,
                None,
                &json!({"spec": {"providerId": "p2"}, "status": {"peerings": []}}),
            )
            .await
            .unwrap()
            .into_typed()
            .unwrap();
        assert_eq!(patched.spec.provider_id.as_deref(), Some("p1"));
        assert!(patched.status.is_some());
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        merge_patch(&mut target, &json!({"b": {"c": null, "x": 9}, "e": [3], "f": "new"}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3, "x": 9}, "e": [3], "f": "new"}));
    }

    // =========================================================================
    // Delete / Garbage Collection
    // =========================================================================

    #[tokio::test]
    async fn test_finalizer_blocks_deletion() {
        let store = MemoryStore::new();
        let mut net = network("a");
        net.metadata.finalizers = Some(vec!["example.io/hold".into()]);
        let created = store.create_typed(net).await.unwrap();
        let key = ObjectKey::of(&created);

        store.delete(&key).await.unwrap();
        let terminating = store.get(&key).await.unwrap();
        assert!(terminating.is_terminating());

        store
            .patch(&key, None, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_owner_deletion_collects_children() {
        let store = MemoryStore::new();
        let owner = store.create_typed(network("owner")).await.unwrap();

        let mut child = prefix("owner-0");
        set_controller_reference(&mut child.metadata, &owner).unwrap();
        store.create_typed(child).await.unwrap();
        store.create_typed(prefix("unrelated")).await.unwrap();

        store.delete(&ObjectKey::of(&owner)).await.unwrap();

        assert!(store.get_opt::<Prefix>("ns", "owner-0").await.unwrap().is_none());
        assert!(store.get_opt::<Prefix>("ns", "unrelated").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_controller_rejected() {
        let store = MemoryStore::new();
        let a = store.create_typed(network("a")).await.unwrap();
        let b = store.create_typed(network("b")).await.unwrap();

        let mut child = prefix("child");
        set_controller_reference(&mut child.metadata, &a).unwrap();
        let mut second = b.controller_owner_ref(&()).unwrap();
        second.controller = Some(true);
        child
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(second);

        let err = store.create_typed(child).await.unwrap_err();
        assert_matches!(err, Error::AlreadyControlled { .. });
    }

    // =========================================================================
    // List / Index / Watch
    // =========================================================================

    #[tokio::test]
    async fn test_field_selector_uses_registered_index() {
        let store = MemoryStore::new();
        store
            .register_index(
                Kind::VirtualIp,
                "claim-uid",
                Arc::new(|o: &Object| {
                    VirtualIp::from_object_ref(o)
                        .and_then(|v| v.spec.target_ref.as_ref())
                        .map(|r| vec![r.uid.clone()])
                        .unwrap_or_default()
                }),
            )
            .unwrap();

        let claimed = VirtualIp {
            metadata: meta("claimed"),
            spec: VirtualIpSpec {
                target_ref: Some(ClaimRef::new("nic", "uid-1")),
                ..Default::default()
            },
            status: None,
        };
        let free = VirtualIp {
            metadata: meta("free"),
            spec: VirtualIpSpec::default(),
            status: None,
        };
        store.create_typed(claimed).await.unwrap();
        store.create_typed(free).await.unwrap();

        let found: Vec<VirtualIp> = store
            .list_typed(&ListParams::namespaced("ns").field("claim-uid", "uid-1"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("claimed"));

        let err = store
            .list(Kind::VirtualIp, &ListParams::all().field("unknown", "x"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Invariant(_));
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let store = MemoryStore::new();
        let mut events = store.watch(Kind::Network).await.unwrap();

        let created = store.create_typed(network("a")).await.unwrap();
        store.delete(&ObjectKey::of(&created)).await.unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.kind, WatchEventKind::Added);
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.kind, WatchEventKind::Deleted);
        assert_eq!(store.count(Kind::Network), 0);
    }
}
