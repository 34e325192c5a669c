//! Domain Layer
//!
//! Ports the reconcilers depend on and the events they publish.
//!
//! # Usage
//!
//! ```ignore
//! use netorch::domain::ports::{ObjectStore, StoreExt};
//! use netorch::crd::Network;
//!
//! async fn peers(store: &dyn ObjectStore) -> Result<Vec<Network>> {
//!     store.list_typed::<Network>(&ListParams::namespaced("tenant")).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::ReconcileEvent;
pub use ports::{
    EventPublisher, FieldSelector, IndexFn, Kind, Kinded, ListParams, Object, ObjectKey,
    ObjectStore, StoreExt, WatchEvent, WatchEventKind, WatchStream,
};
