//! Event Router
//!
//! Translates a change on any watched kind into the primary keys that must
//! be reconciled because of it. Events carry no payload beyond the changed
//! object; reconcilers always re-read.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use crate::domain::ports::{Kind, ListParams, Object, ObjectKey, ObjectStore};
use crate::error::Result;
use crate::ownership::controller_of;

/// Extracts index values from a watched object.
pub type ValuesFn = fn(&Object) -> Vec<String>;

/// Namespace scope of an index lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Primaries in the watched object's namespace
    SameNamespace,
    /// Primaries in any namespace
    AllNamespaces,
}

/// How a watched object maps to primary keys.
#[derive(Clone)]
pub enum Mapping {
    /// The object is itself a primary.
    Identity,
    /// The object's controller, if it is of the primary kind.
    ControllerOwner,
    /// Primaries whose `index` contains any of `values(object)`.
    Index {
        index: &'static str,
        values: ValuesFn,
        scope: Scope,
    },
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mapping::Identity => write!(f, "Identity"),
            Mapping::ControllerOwner => write!(f, "ControllerOwner"),
            Mapping::Index { index, scope, .. } => f
                .debug_struct("Index")
                .field("index", index)
                .field("scope", scope)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub watched: Kind,
    pub mapping: Mapping,
}

/// The kinds a controller watches and how each maps to its primaries.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub primary: Kind,
    pub translations: Vec<Translation>,
}

impl WatchSpec {
    /// Watch the primary kind itself.
    pub fn new(primary: Kind) -> Self {
        Self {
            primary,
            translations: vec![Translation {
                watched: primary,
                mapping: Mapping::Identity,
            }],
        }
    }

    /// Watch children controlled by primaries.
    pub fn owns(mut self, kind: Kind) -> Self {
        self.translations.push(Translation {
            watched: kind,
            mapping: Mapping::ControllerOwner,
        });
        self
    }

    /// Watch `kind` and map it through a primary index.
    pub fn watches(mut self, kind: Kind, index: &'static str, values: ValuesFn, scope: Scope) -> Self {
        self.translations.push(Translation {
            watched: kind,
            mapping: Mapping::Index {
                index,
                values,
                scope,
            },
        });
        self
    }

    /// Distinct watched kinds, primary first.
    pub fn watched_kinds(&self) -> Vec<Kind> {
        let mut kinds = vec![self.primary];
        for t in &self.translations {
            if !kinds.contains(&t.watched) {
                kinds.push(t.watched);
            }
        }
        kinds
    }
}

pub struct EventRouter {
    store: Arc<dyn ObjectStore>,
    spec: WatchSpec,
}

impl EventRouter {
    pub fn new(store: Arc<dyn ObjectStore>, spec: WatchSpec) -> Self {
        Self { store, spec }
    }

    pub fn spec(&self) -> &WatchSpec {
        &self.spec
    }

    /// Primary keys affected by a change of `object`.
    pub async fn route(&self, object: &Object) -> Result<Vec<ObjectKey>> {
        let kind = object.kind();
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let mut keys = BTreeSet::new();

        for translation in self.spec.translations.iter().filter(|t| t.watched == kind) {
            match &translation.mapping {
                Mapping::Identity => {
                    if kind == self.spec.primary {
                        keys.insert(object.key());
                    }
                }
                Mapping::ControllerOwner => {
                    if let Some(owner) = controller_of(object.meta()) {
                        if owner.kind == self.spec.primary.as_str() {
                            keys.insert(ObjectKey::new(
                                self.spec.primary,
                                namespace.clone(),
                                owner.name.clone(),
                            ));
                        }
                    }
                }
                Mapping::Index {
                    index,
                    values,
                    scope,
                } => {
                    for value in values(object) {
                        let params = match scope {
                            Scope::SameNamespace => ListParams::namespaced(namespace.clone()),
                            Scope::AllNamespaces => ListParams::all(),
                        }
                        .field(*index, value);
                        for primary in self.store.list(self.spec.primary, &params).await? {
                            keys.insert(primary.key());
                        }
                    }
                }
            }
        }

        trace!(object = %object.key(), keys = keys.len(), "Routed event");
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::controller::indexes;
    use crate::crd::{
        LoadBalancer, LoadBalancerRouting, LoadBalancerRoutingSpec, LoadBalancerSpec, LocalRef,
        NetworkInterface, NetworkInterfaceSpec,
    };
    use crate::domain::ports::{Kinded, StoreExt};
    use crate::ownership::set_controller_reference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            ..Default::default()
        }
    }

    fn lb_spec() -> WatchSpec {
        WatchSpec::new(Kind::LoadBalancer)
            .owns(Kind::LoadBalancerRouting)
            .watches(
                Kind::NetworkInterface,
                indexes::NETWORK,
                indexes::network_of,
                Scope::SameNamespace,
            )
    }

    async fn lb(store: &MemoryStore, name: &str, network: &str) -> LoadBalancer {
        store
            .create_typed(LoadBalancer {
                metadata: meta(name),
                spec: LoadBalancerSpec {
                    network_ref: LocalRef::new(network),
                    ..Default::default()
                },
                status: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_identity_and_owner_mapping() {
        let store = Arc::new(MemoryStore::new());
        indexes::register_all(store.as_ref()).unwrap();
        let router = EventRouter::new(store.clone(), lb_spec());

        let lb = lb(&store, "lb", "net").await;
        let mut routing_meta = meta("lb");
        set_controller_reference(&mut routing_meta, &lb).unwrap();
        let routing = LoadBalancerRouting {
            metadata: routing_meta,
            spec: LoadBalancerRoutingSpec {
                network_ref: LocalRef::new("net"),
                destinations: vec![],
            },
        };

        let expected = vec![ObjectKey::of(&lb)];
        assert_eq!(router.route(&lb.clone().into_object()).await.unwrap(), expected);
        assert_eq!(router.route(&routing.into_object()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_index_mapping_fans_out() {
        let store = Arc::new(MemoryStore::new());
        indexes::register_all(store.as_ref()).unwrap();
        let router = EventRouter::new(store.clone(), lb_spec());

        lb(&store, "lb-1", "net").await;
        lb(&store, "lb-2", "net").await;
        lb(&store, "lb-3", "other").await;

        let nic = NetworkInterface {
            metadata: meta("nic"),
            spec: NetworkInterfaceSpec {
                network_ref: LocalRef::new("net"),
                ..Default::default()
            },
            status: None,
        };

        let keys = router.route(&nic.into_object()).await.unwrap();
        let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["lb-1", "lb-2"]);
    }

    #[tokio::test]
    async fn test_unwatched_kind_routes_nowhere() {
        let store = Arc::new(MemoryStore::new());
        let router = EventRouter::new(store.clone(), WatchSpec::new(Kind::Network));
        let nic = NetworkInterface {
            metadata: meta("nic"),
            spec: NetworkInterfaceSpec::default(),
            status: None,
        };
        assert!(router.route(&nic.into_object()).await.unwrap().is_empty());
    }

    #[test]
    fn test_watched_kinds_are_distinct() {
        let spec = lb_spec().watches(
            Kind::NetworkInterface,
            indexes::NETWORK,
            indexes::network_of,
            Scope::SameNamespace,
        );
        assert_eq!(
            spec.watched_kinds(),
            vec![
                Kind::LoadBalancer,
                Kind::LoadBalancerRouting,
                Kind::NetworkInterface
            ]
        );
    }
}
