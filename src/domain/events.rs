//! Reconcile Events
//!
//! Immutable records of notable outcomes of a reconcile pass. Events are an
//! audit trail only; user-visible state lives in object status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event representing a notable reconcile outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReconcileEvent {
    // =========================================================================
    // Ephemeral Children
    // =========================================================================
    /// An ephemeral child was created for its parent.
    ChildCreated {
        kind: String,
        namespace: String,
        name: String,
        parent: String,
        timestamp: DateTime<Utc>,
    },

    /// An ephemeral child no longer desired was deleted.
    ChildDeleted {
        kind: String,
        namespace: String,
        name: String,
        parent: String,
        timestamp: DateTime<Utc>,
    },

    /// A child name is taken by an object the parent does not control.
    ChildForeign {
        kind: String,
        namespace: String,
        name: String,
        parent: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Peering and Claims
    // =========================================================================
    /// A peering reached the Bound state.
    PeeringBound {
        namespace: String,
        network: String,
        peering: String,
        peer: String,
        timestamp: DateTime<Utc>,
    },

    /// This side filled its UID into the peer's back-reference.
    PeerUidAssigned {
        namespace: String,
        network: String,
        peer: String,
        timestamp: DateTime<Utc>,
    },

    /// A shared resource was claimed.
    ResourceClaimed {
        kind: String,
        namespace: String,
        name: String,
        claimant: String,
        timestamp: DateTime<Utc>,
    },

    /// A claim on a shared resource was released.
    ResourceReleased {
        kind: String,
        namespace: String,
        name: String,
        claimant_uid: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // NAT Gateway
    // =========================================================================
    /// A target got no port range because the gateway is full.
    NatTargetDropped {
        namespace: String,
        gateway: String,
        target: String,
        timestamp: DateTime<Utc>,
    },
}

impl ReconcileEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ReconcileEvent::ChildCreated { .. } => "ChildCreated",
            ReconcileEvent::ChildDeleted { .. } => "ChildDeleted",
            ReconcileEvent::ChildForeign { .. } => "ChildForeign",
            ReconcileEvent::PeeringBound { .. } => "PeeringBound",
            ReconcileEvent::PeerUidAssigned { .. } => "PeerUidAssigned",
            ReconcileEvent::ResourceClaimed { .. } => "ResourceClaimed",
            ReconcileEvent::ResourceReleased { .. } => "ResourceReleased",
            ReconcileEvent::NatTargetDropped { .. } => "NatTargetDropped",
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ReconcileEvent::ChildCreated { namespace, .. }
            | ReconcileEvent::ChildDeleted { namespace, .. }
            | ReconcileEvent::ChildForeign { namespace, .. }
            | ReconcileEvent::PeeringBound { namespace, .. }
            | ReconcileEvent::PeerUidAssigned { namespace, .. }
            | ReconcileEvent::ResourceClaimed { namespace, .. }
            | ReconcileEvent::ResourceReleased { namespace, .. }
            | ReconcileEvent::NatTargetDropped { namespace, .. } => namespace,
        }
    }

    /// Name of the object the event is about.
    pub fn subject(&self) -> &str {
        match self {
            ReconcileEvent::ChildCreated { name, .. }
            | ReconcileEvent::ChildDeleted { name, .. }
            | ReconcileEvent::ChildForeign { name, .. }
            | ReconcileEvent::ResourceClaimed { name, .. }
            | ReconcileEvent::ResourceReleased { name, .. } => name,
            ReconcileEvent::PeeringBound { network, .. }
            | ReconcileEvent::PeerUidAssigned { network, .. } => network,
            ReconcileEvent::NatTargetDropped { gateway, .. } => gateway,
        }
    }

    pub fn child_created(
        kind: impl ToString,
        namespace: impl Into<String>,
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        ReconcileEvent::ChildCreated {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            parent: parent.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn child_deleted(
        kind: impl ToString,
        namespace: impl Into<String>,
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        ReconcileEvent::ChildDeleted {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            parent: parent.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn child_foreign(
        kind: impl ToString,
        namespace: impl Into<String>,
        name: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        ReconcileEvent::ChildForeign {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            parent: parent.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn peering_bound(
        namespace: impl Into<String>,
        network: impl Into<String>,
        peering: impl Into<String>,
        peer: impl Into<String>,
    ) -> Self {
        ReconcileEvent::PeeringBound {
            namespace: namespace.into(),
            network: network.into(),
            peering: peering.into(),
            peer: peer.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn peer_uid_assigned(
        namespace: impl Into<String>,
        network: impl Into<String>,
        peer: impl Into<String>,
    ) -> Self {
        ReconcileEvent::PeerUidAssigned {
            namespace: namespace.into(),
            network: network.into(),
            peer: peer.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_claimed(
        kind: impl ToString,
        namespace: impl Into<String>,
        name: impl Into<String>,
        claimant: impl Into<String>,
    ) -> Self {
        ReconcileEvent::ResourceClaimed {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            claimant: claimant.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn resource_released(
        kind: impl ToString,
        namespace: impl Into<String>,
        name: impl Into<String>,
        claimant_uid: impl Into<String>,
    ) -> Self {
        ReconcileEvent::ResourceReleased {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            claimant_uid: claimant_uid.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn nat_target_dropped(
        namespace: impl Into<String>,
        gateway: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        ReconcileEvent::NatTargetDropped {
            namespace: namespace.into(),
            gateway: gateway.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = ReconcileEvent::child_created("Prefix", "ns", "nic-0", "nic");
        assert_eq!(event.event_type(), "ChildCreated");

        let event = ReconcileEvent::nat_target_dropped("ns", "gw", "nic");
        assert_eq!(event.event_type(), "NatTargetDropped");
    }

    #[test]
    fn test_event_subject() {
        let event = ReconcileEvent::resource_released("VirtualIp", "ns", "vip", "uid-1");
        assert_eq!(event.namespace(), "ns");
        assert_eq!(event.subject(), "vip");

        let event = ReconcileEvent::peer_uid_assigned("ns", "a", "ns/b");
        assert_eq!(event.subject(), "a");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ReconcileEvent::peering_bound("ns", "a", "to-b", "ns/b");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PeeringBound");
        assert_eq!(json["peering"], "to-b");
    }
}
