//! Netorch - Declarative Network Control Plane
//!
//! Controllers that converge networking resources (networks, peerings,
//! network interfaces, virtual IPs, prefixes, load balancers and NAT
//! gateways) toward their declared state.
//!
//! # Architecture
//!
//! ```text
//! ObjectStore watch ──► EventRouter ──► WorkQueue ──► Reconciler
//!        ▲                                                 │
//!        └──────────── status / children / claims ◄────────┘
//! ```
//!
//! # Modules
//!
//! - [`absence`] - LRU of claimants confirmed deleted
//! - [`adapters`] - Kubernetes and in-memory object stores, event publishers
//! - [`allocator`] - NAT port-slot allocation
//! - [`controller`] - Work queue, event router, manager and the controllers
//! - [`crd`] - Custom Resource Definitions
//! - [`domain`] - Ports and events
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`ownership`] - Controller references and ephemeral children
//! - [`peering`] - Two-sided reference matching and claims

pub mod absence;
pub mod adapters;
pub mod allocator;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ownership;
pub mod peering;

// Re-export commonly used types
pub use absence::AbsenceCache;
pub use controller::{Action, Context, ControllerManager, ManagerConfig, Reconciler};
pub use crd::{LoadBalancer, NatGateway, Network, NetworkInterface, Prefix, VirtualIp};
pub use domain::ports::{Kind, ObjectKey, ObjectStore};
pub use error::{Error, Result};
