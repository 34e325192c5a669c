//! Claim Release Controller
//!
//! Clears the claim on a Prefix or VirtualIp once its claimant interface is
//! gone, was recreated under a new UID, or no longer references the object.
//! Claimant existence checks go through the absence cache, so many objects
//! claimed by the same vanished interface cost one read between them.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::indexes;
use super::reconciler::{Action, Context, Reconciler};
use super::router::{Scope, WatchSpec};
use crate::absence::Presence;
use crate::crd::{ClaimRef, NetworkInterface, Prefix, VirtualIp};
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{Kind, Kinded, ObjectKey, StoreExt};
use crate::error::Result;
use crate::ownership::is_controlled_by;

/// A resource an interface can claim.
pub trait Claimable: Kinded {
    /// Controller name for this kind.
    const CONTROLLER: &'static str;
    /// JSON name of the claim field under `spec`.
    const CLAIM_FIELD: &'static str;

    fn claim(&self) -> Option<&ClaimRef>;

    /// Whether `nic` still references this object.
    fn referenced_by(&self, nic: &NetworkInterface) -> bool;
}

impl Claimable for VirtualIp {
    const CONTROLLER: &'static str = "virtual-ip-release";
    const CLAIM_FIELD: &'static str = "targetRef";

    fn claim(&self) -> Option<&ClaimRef> {
        self.spec.target_ref.as_ref()
    }

    fn referenced_by(&self, nic: &NetworkInterface) -> bool {
        let name = self.name_any();
        if nic.virtual_ip_ref_name() == Some(name.as_str()) {
            return true;
        }
        let ephemeral = nic
            .spec
            .virtual_ip
            .as_ref()
            .is_some_and(|v| v.ephemeral.is_some());
        ephemeral && (nic.ephemeral_virtual_ip_name() == name || is_controlled_by(self.meta(), nic.meta()))
    }
}

impl Claimable for Prefix {
    const CONTROLLER: &'static str = "prefix-release";
    const CLAIM_FIELD: &'static str = "claimRef";

    fn claim(&self) -> Option<&ClaimRef> {
        self.spec.claim_ref.as_ref()
    }

    fn referenced_by(&self, nic: &NetworkInterface) -> bool {
        let name = self.name_any();
        nic.spec
            .ips
            .iter()
            .enumerate()
            .any(|(i, source)| source.ephemeral.is_some() && nic.ephemeral_prefix_name(i) == name)
    }
}

pub struct ReleaseReconciler<T> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Claimable> ReleaseReconciler<T> {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    pub fn watch_spec() -> WatchSpec {
        WatchSpec::new(T::KIND).watches(
            Kind::NetworkInterface,
            indexes::CLAIM_UID,
            indexes::uid_of,
            Scope::SameNamespace,
        )
    }

    /// Whether the claim on `resource` should be dropped.
    async fn is_stale(&self, resource: &T, claim: &ClaimRef) -> Result<bool> {
        let claimant = ObjectKey::new(
            Kind::NetworkInterface,
            resource.namespace().unwrap_or_default(),
            &claim.name,
        );
        let presence = self
            .ctx
            .absence
            .lookup_claimant(self.ctx.store.as_ref(), &claimant, &claim.uid)
            .await?;

        let object = match presence {
            Presence::Gone => {
                debug!(claimant = %claimant, "Claimant gone");
                return Ok(true);
            }
            Presence::Present(object) => object,
        };
        if object.uid() != Some(claim.uid.as_str()) {
            debug!(claimant = %claimant, "Claimant recreated under a new UID");
            return Ok(true);
        }
        let nic: NetworkInterface = object.into_typed()?;
        Ok(!resource.referenced_by(&nic))
    }
}

#[async_trait]
impl<T: Claimable> Reconciler for ReleaseReconciler<T> {
    fn name(&self) -> &'static str {
        T::CONTROLLER
    }

    fn kind(&self) -> Kind {
        T::KIND
    }

    #[instrument(skip(self), fields(resource = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(resource) = self.ctx.store.get_opt::<T>(&key.namespace, &key.name).await? else {
            return Ok(Action::await_change());
        };
        if resource.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }
        let Some(claim) = resource.claim().cloned() else {
            return Ok(Action::await_change());
        };
        if !self.is_stale(&resource, &claim).await? {
            return Ok(Action::await_change());
        }

        let mut spec = serde_json::Map::new();
        spec.insert(T::CLAIM_FIELD.to_string(), serde_json::Value::Null);
        self.ctx
            .store
            .patch(
                key,
                resource.meta().resource_version.as_deref(),
                &json!({ "spec": spec }),
            )
            .await?;
        info!(claimant = %claim.name, uid = %claim.uid, "Released claim");
        self.ctx
            .publish(ReconcileEvent::resource_released(
                T::KIND,
                &key.namespace,
                &key.name,
                &claim.uid,
            ))
            .await;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::absence::AbsenceCache;
    use crate::adapters::{InMemoryEventCollector, MemoryStore};
    use crate::crd::{
        IpSource, LocalRef, NetworkInterfaceSpec, PrefixSpec, PrefixTemplate, VirtualIpSource,
        VirtualIpSpec,
    };
    use crate::domain::ports::{IndexFn, ListParams, Object, ObjectStore, WatchStream};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads of NetworkInterfaces.
    struct CountingStore {
        inner: MemoryStore,
        nic_gets: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn get(&self, key: &ObjectKey) -> Result<Object> {
            if key.kind == Kind::NetworkInterface {
                self.nic_gets.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.get(key).await
        }
        async fn list(&self, kind: Kind, params: &ListParams) -> Result<Vec<Object>> {
            self.inner.list(kind, params).await
        }
        async fn watch(&self, kind: Kind) -> Result<WatchStream> {
            self.inner.watch(kind).await
        }
        async fn create(&self, object: Object) -> Result<Object> {
            self.inner.create(object).await
        }
        async fn patch(
            &self,
            key: &ObjectKey,
            version: Option<&str>,
            doc: &serde_json::Value,
        ) -> Result<Object> {
            self.inner.patch(key, version, doc).await
        }
        async fn patch_status(
            &self,
            key: &ObjectKey,
            version: Option<&str>,
            doc: &serde_json::Value,
        ) -> Result<Object> {
            self.inner.patch_status(key, version, doc).await
        }
        async fn delete(&self, key: &ObjectKey) -> Result<()> {
            self.inner.delete(key).await
        }
        fn register_index(&self, kind: Kind, name: &str, index: IndexFn) -> Result<()> {
            self.inner.register_index(kind, name, index)
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        events: Arc<InMemoryEventCollector>,
        ctx: Arc<Context>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            nic_gets: AtomicUsize::new(0),
        });
        indexes::register_all(store.as_ref()).unwrap();
        let events = Arc::new(InMemoryEventCollector::new());
        let ctx = Context::new(store.clone(), events.clone(), Arc::new(AbsenceCache::new(16)));
        Fixture { store, events, ctx }
    }

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            ..Default::default()
        }
    }

    async fn nic(store: &CountingStore, name: &str, spec: NetworkInterfaceSpec) -> NetworkInterface {
        store
            .create_typed(NetworkInterface {
                metadata: meta(name),
                spec,
                status: None,
            })
            .await
            .unwrap()
    }

    fn referencing(vip: &str) -> NetworkInterfaceSpec {
        NetworkInterfaceSpec {
            network_ref: LocalRef::new("net"),
            virtual_ip: Some(VirtualIpSource {
                virtual_ip_ref: Some(LocalRef::new(vip)),
                ephemeral: None,
            }),
            ..Default::default()
        }
    }

    async fn vip(store: &CountingStore, name: &str, claim: Option<ClaimRef>) -> VirtualIp {
        store
            .create_typed(VirtualIp {
                metadata: meta(name),
                spec: VirtualIpSpec {
                    target_ref: claim,
                    ..Default::default()
                },
                status: None,
            })
            .await
            .unwrap()
    }

    async fn target_ref(store: &CountingStore, name: &str) -> Option<ClaimRef> {
        store
            .get_typed::<VirtualIp>("ns", name)
            .await
            .unwrap()
            .spec
            .target_ref
    }

    fn vip_key(name: &str) -> ObjectKey {
        ObjectKey::new(Kind::VirtualIp, "ns", name)
    }

    #[tokio::test]
    async fn test_live_claimant_keeps_claim() {
        let f = fixture();
        let nic = nic(&f.store, "nic", referencing("vip")).await;
        let claim = ClaimRef::new("nic", nic.metadata.uid.clone().unwrap());
        vip(&f.store, "vip", Some(claim.clone())).await;

        let reconciler = ReleaseReconciler::<VirtualIp>::new(f.ctx.clone());
        reconciler.reconcile(&vip_key("vip")).await.unwrap();

        assert_eq!(target_ref(&f.store, "vip").await, Some(claim));
        assert!(f.events.events_of_type("ResourceReleased").is_empty());
    }

    #[tokio::test]
    async fn test_vanished_claimant_read_once() {
        let f = fixture();
        for name in ["vip-a", "vip-b"] {
            vip(&f.store, name, Some(ClaimRef::new("nic", "uid-gone"))).await;
        }

        let reconciler = ReleaseReconciler::<VirtualIp>::new(f.ctx.clone());
        reconciler.reconcile(&vip_key("vip-a")).await.unwrap();
        reconciler.reconcile(&vip_key("vip-b")).await.unwrap();

        assert_eq!(target_ref(&f.store, "vip-a").await, None);
        assert_eq!(target_ref(&f.store, "vip-b").await, None);
        assert_eq!(f.store.nic_gets.load(Ordering::SeqCst), 1);
        assert_eq!(f.events.events_of_type("ResourceReleased").len(), 2);
    }

    #[tokio::test]
    async fn test_recreated_claimant_releases() {
        let f = fixture();
        nic(&f.store, "nic", referencing("vip")).await;
        vip(&f.store, "vip", Some(ClaimRef::new("nic", "uid-old"))).await;

        let reconciler = ReleaseReconciler::<VirtualIp>::new(f.ctx.clone());
        reconciler.reconcile(&vip_key("vip")).await.unwrap();

        assert_eq!(target_ref(&f.store, "vip").await, None);
        assert!(!f.ctx.absence.contains("uid-old"), "present name is not absence");
    }

    #[tokio::test]
    async fn test_dropped_reference_releases() {
        let f = fixture();
        let nic = nic(&f.store, "nic", referencing("other")).await;
        vip(
            &f.store,
            "vip",
            Some(ClaimRef::new("nic", nic.metadata.uid.clone().unwrap())),
        )
        .await;

        let reconciler = ReleaseReconciler::<VirtualIp>::new(f.ctx.clone());
        reconciler.reconcile(&vip_key("vip")).await.unwrap();

        assert_eq!(target_ref(&f.store, "vip").await, None);
    }

    #[tokio::test]
    async fn test_prefix_released_when_source_removed() {
        let f = fixture();
        let template = PrefixTemplate {
            metadata: Default::default(),
            spec: PrefixSpec::default(),
        };
        let nic = nic(
            &f.store,
            "nic",
            NetworkInterfaceSpec {
                network_ref: LocalRef::new("net"),
                ips: vec![IpSource::literal("10.0.0.1"), IpSource::ephemeral(template)],
                ..Default::default()
            },
        )
        .await;
        let uid = nic.metadata.uid.clone().unwrap();
        for name in ["nic-1", "nic-0"] {
            f.store
                .create_typed(Prefix {
                    metadata: meta(name),
                    spec: PrefixSpec {
                        claim_ref: Some(ClaimRef::new("nic", uid.clone())),
                        ..Default::default()
                    },
                    status: None,
                })
                .await
                .unwrap();
        }

        let reconciler = ReleaseReconciler::<Prefix>::new(f.ctx.clone());
        for name in ["nic-0", "nic-1"] {
            reconciler
                .reconcile(&ObjectKey::new(Kind::Prefix, "ns", name))
                .await
                .unwrap();
        }

        let kept: Prefix = f.store.get_typed("ns", "nic-1").await.unwrap();
        assert!(kept.spec.claim_ref.is_some());
        let released: Prefix = f.store.get_typed("ns", "nic-0").await.unwrap();
        assert!(released.spec.claim_ref.is_none(), "index 0 is a literal address");
    }

    #[tokio::test]
    async fn test_watch_routes_interface_to_claimed_objects() {
        let f = fixture();
        let nic = nic(&f.store, "nic", referencing("vip")).await;
        vip(
            &f.store,
            "vip",
            Some(ClaimRef::new("nic", nic.metadata.uid.clone().unwrap())),
        )
        .await;
        vip(&f.store, "unclaimed", None).await;

        let router = super::super::router::EventRouter::new(
            f.store.clone(),
            ReleaseReconciler::<VirtualIp>::watch_spec(),
        );
        let keys = router.route(&nic.into_object()).await.unwrap();
        assert_eq!(keys, vec![vip_key("vip")]);
    }
}
