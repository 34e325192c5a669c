//! Reconciler Contract
//!
//! A reconciler converges the store toward the desired state of one primary
//! object, identified by its key. It always re-reads the current state, never
//! trusts the triggering event, and is safe to run any number of times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::absence::AbsenceCache;
use crate::domain::events::ReconcileEvent;
use crate::domain::ports::{EventPublisher, Kind, Kinded, ObjectKey, ObjectStore};
use crate::error::Result;

/// What the manager does with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Wait for the next relevant event.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Reconcile again after `duration` even without events.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Converges one kind of primary object.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Kind of the primary objects.
    fn kind(&self) -> Kind;

    /// Run one pass for `key`. A missing object is a successful no-op.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Shared dependencies of all reconcilers.
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventPublisher>,
    pub absence: Arc<AbsenceCache>,
}

impl Context {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventPublisher>,
        absence: Arc<AbsenceCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            absence,
        })
    }

    /// Publish an event. Publishing failures are logged, never returned.
    pub async fn publish(&self, event: ReconcileEvent) {
        if let Err(e) = self.events.publish(event).await {
            tracing::warn!(error = %e, "Failed to publish event");
        }
    }

    /// Patch the status of `resource` to `status`, unless it already matches.
    ///
    /// The write carries the resource version read at the start of the pass,
    /// so a concurrent writer surfaces as a conflict. Returns the object as
    /// written, or `None` if no write was needed.
    pub async fn write_status<T, S>(
        &self,
        resource: &T,
        current: Option<&S>,
        computed: &S,
    ) -> Result<Option<T>>
    where
        T: Kinded,
        S: Serialize + PartialEq,
    {
        if current == Some(computed) {
            return Ok(None);
        }
        let key = ObjectKey::of(resource);
        let written = self
            .store
            .patch_status(
                &key,
                resource.meta().resource_version.as_deref(),
                &json!({ "status": computed }),
            )
            .await?;
        Ok(Some(written.into_typed()?))
    }
}
