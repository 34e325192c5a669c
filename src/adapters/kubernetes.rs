//! Kubernetes Object Store Adapter
//!
//! Implements the `ObjectStore` port against a Kubernetes API server. Writes
//! are JSON merge patches; when a version token is supplied it is sent as
//! `metadata.resourceVersion`, which makes the API server reject stale writes
//! with 409 Conflict. Field indexes are evaluated client-side on list results.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams as KubeListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::crd::{
    LoadBalancer, LoadBalancerRouting, NatGateway, NatGatewayRouting, Network, NetworkInterface,
    Prefix, VirtualIp,
};
use crate::domain::ports::{
    IndexFn, Kind, Kinded, ListParams, Object, ObjectKey, ObjectStore, WatchEvent, WatchEventKind,
    WatchStream,
};
use crate::error::{Error, Result};

/// Field manager name recorded on every write.
pub const FIELD_MANAGER: &str = "netorch";

/// Run `$body` with `$T` bound to the resource type of `$kind`.
macro_rules! with_kind {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            Kind::Network => {
                type $T = Network;
                $body
            }
            Kind::NetworkInterface => {
                type $T = NetworkInterface;
                $body
            }
            Kind::LoadBalancer => {
                type $T = LoadBalancer;
                $body
            }
            Kind::LoadBalancerRouting => {
                type $T = LoadBalancerRouting;
                $body
            }
            Kind::NatGateway => {
                type $T = NatGateway;
                $body
            }
            Kind::NatGatewayRouting => {
                type $T = NatGatewayRouting;
                $body
            }
            Kind::Prefix => {
                type $T = Prefix;
                $body
            }
            Kind::VirtualIp => {
                type $T = VirtualIp;
                $body
            }
        }
    };
}

/// Kubernetes-backed object store adapter.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
    indexes: std::sync::Arc<DashMap<(Kind, String), IndexFn>>,
}

impl KubeObjectStore {
    /// Create a new store over an API client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            indexes: Default::default(),
        }
    }

    fn api<T: Kinded>(&self, namespace: Option<&str>) -> Api<T> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for KubeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectStore")
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

/// Label selector string for a list call.
fn label_selector(params: &ListParams) -> Option<String> {
    if params.labels.is_empty() {
        return None;
    }
    Some(
        params
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Add the version precondition to a merge patch document.
fn with_version(doc: &Value, version: Option<&str>) -> Value {
    let mut doc = doc.clone();
    if let (Some(version), Some(map)) = (version, doc.as_object_mut()) {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".into(), Value::String(version.to_string()));
        }
    }
    doc
}

/// Map an API error onto store outcomes keyed by the object identity.
fn api_error(key: &ObjectKey) -> impl FnOnce(kube::Error) -> Error + '_ {
    move |err| match Error::from(err) {
        Error::NotFound { .. } => Error::not_found(key),
        Error::Conflict { .. } => Error::conflict(key),
        Error::AlreadyExists { .. } => Error::already_exists(key),
        other => other,
    }
}

fn watch_event<T: Kinded>(event: watcher::Event<T>) -> Option<WatchEvent> {
    let (kind, object) = match event {
        watcher::Event::InitApply(object) => (WatchEventKind::Added, object),
        watcher::Event::Apply(object) => (WatchEventKind::Modified, object),
        watcher::Event::Delete(object) => (WatchEventKind::Deleted, object),
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };
    Some(WatchEvent {
        kind,
        object: object.into_object(),
    })
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ObjectKey) -> Result<Object> {
        with_kind!(key.kind, T => {
            let object = self
                .api::<T>(Some(&key.namespace))
                .get(&key.name)
                .await
                .map_err(api_error(key))?;
            Ok(object.into_object())
        })
    }

    #[instrument(skip(self, params), fields(kind = %kind))]
    async fn list(&self, kind: Kind, params: &ListParams) -> Result<Vec<Object>> {
        let mut lp = KubeListParams::default();
        if let Some(selector) = label_selector(params) {
            lp = lp.labels(&selector);
        }

        let objects: Vec<Object> = with_kind!(kind, T => {
            self.api::<T>(params.namespace.as_deref())
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(T::into_object)
                .collect()
        });

        let Some(field) = &params.field else {
            return Ok(objects);
        };

        let index = self
            .indexes
            .get(&(kind, field.index.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::Invariant(format!("no index {} registered for {}", field.index, kind))
            })?;

        Ok(objects
            .into_iter()
            .filter(|o| index(o).contains(&field.value))
            .collect())
    }

    async fn watch(&self, kind: Kind) -> Result<WatchStream> {
        let stream = with_kind!(kind, T => {
            watcher(self.api::<T>(None), watcher::Config::default())
                .filter_map(|event| async move {
                    match event {
                        Ok(event) => watch_event::<T>(event).map(Ok),
                        Err(e) => Some(Err(Error::Transient(format!("watch failed: {}", e)))),
                    }
                })
                .boxed()
        });
        Ok(stream)
    }

    #[instrument(skip(self, object), fields(key = %object.key()))]
    async fn create(&self, object: Object) -> Result<Object> {
        let key = object.key();
        with_kind!(key.kind, T => {
            let typed = object.into_typed::<T>()?;
            let created = self
                .api::<T>(Some(&key.namespace))
                .create(&PostParams::default(), &typed)
                .await
                .map_err(api_error(&key))?;
            debug!(key = %key, "Created object");
            Ok(created.into_object())
        })
    }

    #[instrument(skip(self, doc), fields(key = %key))]
    async fn patch(&self, key: &ObjectKey, version: Option<&str>, doc: &Value) -> Result<Object> {
        let doc = with_version(doc, version);
        with_kind!(key.kind, T => {
            let patched = self
                .api::<T>(Some(&key.namespace))
                .patch(&key.name, &Self::patch_params(), &Patch::Merge(&doc))
                .await
                .map_err(api_error(key))?;
            Ok(patched.into_object())
        })
    }

    #[instrument(skip(self, doc), fields(key = %key))]
    async fn patch_status(
        &self,
        key: &ObjectKey,
        version: Option<&str>,
        doc: &Value,
    ) -> Result<Object> {
        let doc = with_version(doc, version);
        with_kind!(key.kind, T => {
            let patched = self
                .api::<T>(Some(&key.namespace))
                .patch_status(&key.name, &Self::patch_params(), &Patch::Merge(&doc))
                .await
                .map_err(api_error(key))?;
            Ok(patched.into_object())
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        with_kind!(key.kind, T => {
            self.api::<T>(Some(&key.namespace))
                .delete(&key.name, &DeleteParams::default())
                .await
                .map_err(api_error(key))?;
        });
        debug!(key = %key, "Deleted object");
        Ok(())
    }

    fn register_index(&self, kind: Kind, name: &str, index: IndexFn) -> Result<()> {
        self.indexes.insert((kind, name.to_string()), index);
        Ok(())
    }
}
