//! Domain Ports (Port/Adapter Pattern)
//!
//! The reconcilers depend only on the traits defined here. Infrastructure
//! adapters (an in-process store, a Kubernetes API server) implement them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │        ObjectStore │ StoreExt │ EventPublisher       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  MemoryStore │ KubeObjectStore │ LoggingPublisher    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::events::ReconcileEvent;
use crate::crd::{
    LoadBalancer, LoadBalancerRouting, NatGateway, NatGatewayRouting, Network, NetworkInterface,
    Prefix, VirtualIp,
};
use crate::error::{Error, Result};

// =============================================================================
// Kinds and Objects
// =============================================================================

/// Declares the closed set of resource kinds, the `Object` union over them
/// and the `Kinded` bridge from each typed resource into the union.
macro_rules! resource_kinds {
    ($($variant:ident),+ $(,)?) => {
        /// Resource kind handled by the control plane.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Kind {
            $($variant),+
        }

        impl Kind {
            /// All kinds, in declaration order.
            pub const ALL: &'static [Kind] = &[$(Kind::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Kind::$variant => stringify!($variant)),+
                }
            }
        }

        /// A stored object of any kind.
        #[derive(Debug, Clone)]
        pub enum Object {
            $($variant($variant)),+
        }

        impl Object {
            pub fn kind(&self) -> Kind {
                match self {
                    $(Object::$variant(_) => Kind::$variant),+
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Object::$variant(o) => &o.metadata),+
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Object::$variant(o) => &mut o.metadata),+
                }
            }

            pub fn to_value(&self) -> Result<serde_json::Value> {
                Ok(match self {
                    $(Object::$variant(o) => serde_json::to_value(o)?),+
                })
            }

            pub fn from_value(kind: Kind, value: serde_json::Value) -> Result<Object> {
                Ok(match kind {
                    $(Kind::$variant => Object::$variant(serde_json::from_value(value)?)),+
                })
            }
        }

        $(
            impl Kinded for $variant {
                const KIND: Kind = Kind::$variant;

                fn into_object(self) -> Object {
                    Object::$variant(self)
                }

                fn from_object(object: Object) -> Option<Self> {
                    match object {
                        Object::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn from_object_ref(object: &Object) -> Option<&Self> {
                    match object {
                        Object::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+
    };
}

resource_kinds!(
    Network,
    NetworkInterface,
    LoadBalancer,
    LoadBalancerRouting,
    NatGateway,
    NatGatewayRouting,
    Prefix,
    VirtualIp,
);

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Object {
    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(
            self.kind(),
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    /// Convert into a typed resource; a kind mismatch is a programming error.
    pub fn into_typed<T: Kinded>(self) -> Result<T> {
        let kind = self.kind();
        T::from_object(self).ok_or_else(|| {
            Error::Invariant(format!("expected {} object, store returned {}", T::KIND, kind))
        })
    }
}

/// A namespaced resource that can be stored as an [`Object`].
pub trait Kinded:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: Kind;

    fn into_object(self) -> Object;

    fn from_object(object: Object) -> Option<Self>;

    fn from_object_ref(object: &Object) -> Option<&Self>;
}

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a typed resource.
    pub fn of<T: Kinded>(resource: &T) -> Self {
        let meta = resource.meta();
        Self::new(
            T::KIND,
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// `namespace/name`, as used by cross-namespace indexes.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Index function: object -> index values. Registered per (kind, name).
pub type IndexFn = Arc<dyn Fn(&Object) -> Vec<String> + Send + Sync>;

/// Server-side field selector on a registered index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub index: String,
    pub value: String,
}

/// Parameters of a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Restrict to one namespace; `None` lists all namespaces.
    pub namespace: Option<String>,
    /// Objects must carry all of these labels.
    pub labels: BTreeMap<String, String>,
    pub field: Option<FieldSelector>,
}

impl ListParams {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, index: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = Some(FieldSelector {
            index: index.into(),
            value: value.into(),
        });
        self
    }

    /// Whether an object passes the namespace and label filters.
    pub fn matches_meta(&self, meta: &ObjectMeta) -> bool {
        let namespace_ok = self
            .namespace
            .as_deref()
            .map_or(true, |ns| meta.namespace.as_deref() == Some(ns));
        let labels = meta.labels.as_ref();
        namespace_ok
            && self
                .labels
                .iter()
                .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// Kind of change reported by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// One change reported by a watch stream.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub object: Object,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Port for the versioned, watchable object store.
///
/// All writes are optimistic: a `version` token that no longer matches the
/// stored object fails with [`Error::Conflict`]. Patch documents are JSON
/// merge patches (RFC 7386).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get one object; [`Error::NotFound`] if absent.
    async fn get(&self, key: &ObjectKey) -> Result<Object>;

    /// List objects of a kind. Field selectors need a registered index.
    async fn list(&self, kind: Kind, params: &ListParams) -> Result<Vec<Object>>;

    /// Stream future changes of a kind.
    async fn watch(&self, kind: Kind) -> Result<WatchStream>;

    /// Create an object; [`Error::AlreadyExists`] if the name is taken.
    async fn create(&self, object: Object) -> Result<Object>;

    /// Merge-patch metadata and spec. `status` in the document is ignored.
    async fn patch(
        &self,
        key: &ObjectKey,
        version: Option<&str>,
        doc: &serde_json::Value,
    ) -> Result<Object>;

    /// Merge-patch the status. Only `status` in the document is applied.
    async fn patch_status(
        &self,
        key: &ObjectKey,
        version: Option<&str>,
        doc: &serde_json::Value,
    ) -> Result<Object>;

    /// Delete an object. Objects with finalizers are only marked terminating.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Register an index usable by field selectors.
    fn register_index(&self, kind: Kind, name: &str, index: IndexFn) -> Result<()>;
}

/// Typed convenience layer over [`ObjectStore`].
#[async_trait]
pub trait StoreExt: ObjectStore {
    async fn get_typed<T: Kinded>(&self, namespace: &str, name: &str) -> Result<T> {
        let key = ObjectKey::new(T::KIND, namespace, name);
        self.get(&key).await?.into_typed()
    }

    /// Like `get_typed`, but NotFound becomes `None`.
    async fn get_opt<T: Kinded>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        match self.get_typed::<T>(namespace, name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_typed<T: Kinded>(&self, params: &ListParams) -> Result<Vec<T>> {
        self.list(T::KIND, params)
            .await?
            .into_iter()
            .map(Object::into_typed)
            .collect()
    }

    async fn create_typed<T: Kinded>(&self, resource: T) -> Result<T> {
        self.create(resource.into_object()).await?.into_typed()
    }
}

impl<S: ObjectStore + ?Sized> StoreExt for S {}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing reconcile events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: ReconcileEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<ReconcileEvent>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{NetworkSpec, PrefixSpec};

    fn network(ns: &str, name: &str) -> Network {
        Network {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            spec: NetworkSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new(Kind::NatGateway, "tenant", "gw");
        assert_eq!(key.to_string(), "NatGateway tenant/gw");
        assert_eq!(key.namespaced_name(), "tenant/gw");
    }

    #[test]
    fn test_kinded_round_trip_through_object() {
        let object = network("ns", "a").into_object();
        assert_eq!(object.kind(), Kind::Network);
        assert_eq!(object.key(), ObjectKey::new(Kind::Network, "ns", "a"));

        assert!(Prefix::from_object_ref(&object).is_none());
        let back: Network = object.into_typed().unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("a"));
    }

    #[test]
    fn test_into_typed_kind_mismatch_is_invariant() {
        let object = Prefix {
            metadata: ObjectMeta::default(),
            spec: PrefixSpec::default(),
            status: None,
        }
        .into_object();

        let err = object.into_typed::<Network>().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Invariant);
    }

    #[test]
    fn test_list_params_matching() {
        let mut meta = network("ns", "a").metadata;
        meta.labels = Some([("app".to_string(), "web".to_string())].into());

        assert!(ListParams::all().matches_meta(&meta));
        assert!(ListParams::namespaced("ns").label("app", "web").matches_meta(&meta));
        assert!(!ListParams::namespaced("other").matches_meta(&meta));
        assert!(!ListParams::all().label("app", "db").matches_meta(&meta));
    }

    #[test]
    fn test_object_value_round_trip() {
        let object = network("ns", "a").into_object();
        let value = object.to_value().unwrap();
        assert_eq!(value["kind"], "Network");
        let back = Object::from_value(Kind::Network, value).unwrap();
        assert_eq!(back.key(), object.key());
    }
}
