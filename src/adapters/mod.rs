//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            ObjectStore │ EventPublisher                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ KubeObjectStore │ MemoryStore                               │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use netorch::adapters::MemoryStore;
//! use netorch::domain::ports::{ObjectKey, Kind, ObjectStore};
//!
//! let store = MemoryStore::new();
//! let object = store.get(&ObjectKey::new(Kind::Network, "default", "net")).await?;
//! ```

mod event_publisher;
mod kubernetes;
mod memory;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use kubernetes::{KubeObjectStore, FIELD_MANAGER};
pub use memory::{merge_patch, MemoryStore};
