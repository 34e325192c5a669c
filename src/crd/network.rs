//! Network Custom Resource Definition
//!
//! A Network is an isolated virtual network. Networks can be peered with each
//! other; a peering only becomes `Bound` once both sides reference each other
//! and have confirmed each other's UID.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Network CRD
// =============================================================================

/// Network defines a virtual network and its desired peerings.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "Network",
    plural = "networks",
    shortname = "net",
    status = "NetworkStatus",
    namespaced,
    printcolumn = r#"{"name": "Handle", "type": "string", "jsonPath": ".spec.providerId"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Stable handle of the network, published by the data-plane agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Desired peerings. Names are unique within the list.
    #[serde(default)]
    pub peerings: Vec<NetworkPeering>,

    /// Networks that have bound a peering to this network.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peering_claim_refs: Vec<PeeringClaimRef>,
}

/// A desired peering with another network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeering {
    pub name: String,

    pub network_ref: PeerRef,

    /// Prefixes of the peer that should be routed; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<PeeringPrefix>,
}

/// Reference to a peer network. The UID is filled in by the peer's
/// controller once the peer has confirmed the back-reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    pub name: String,

    /// Defaults to the referencing network's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Prefix filter for a peering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeeringPrefix {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Record of a network bound to this one.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeeringClaimRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the Network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub peerings: Vec<NetworkPeeringStatus>,
}

/// Observed state of one peering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeeringStatus {
    pub name: String,

    pub state: PeeringState,

    /// Handle of the peer network once bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Peering state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PeeringState {
    #[default]
    Pending,
    Bound,
    Error,
}

impl std::fmt::Display for PeeringState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeeringState::Pending => write!(f, "Pending"),
            PeeringState::Bound => write!(f, "Bound"),
            PeeringState::Error => write!(f, "Error"),
        }
    }
}

impl Network {
    /// Namespace a peering reference resolves to.
    pub fn peer_namespace<'a>(&'a self, reference: &'a PeerRef) -> &'a str {
        reference
            .namespace
            .as_deref()
            .or(self.metadata.namespace.as_deref())
            .unwrap_or("default")
    }

    /// Status of the named peering, if reported.
    pub fn peering_status(&self, name: &str) -> Option<&NetworkPeeringStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.peerings.iter().find(|p| p.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_peer_namespace_defaults_to_own() {
        let network = Network {
            metadata: ObjectMeta {
                name: Some("a".into()),
                namespace: Some("tenant".into()),
                ..Default::default()
            },
            spec: NetworkSpec::default(),
            status: None,
        };

        let local = PeerRef {
            name: "b".into(),
            ..Default::default()
        };
        let remote = PeerRef {
            name: "b".into(),
            namespace: Some("other".into()),
            uid: None,
        };

        assert_eq!(network.peer_namespace(&local), "tenant");
        assert_eq!(network.peer_namespace(&remote), "other");
    }

    #[test]
    fn test_network_spec_serializes_camel_case() {
        let spec = NetworkSpec {
            provider_id: Some("vni-42".into()),
            peerings: vec![NetworkPeering {
                name: "to-b".into(),
                network_ref: PeerRef {
                    name: "b".into(),
                    namespace: None,
                    uid: Some("uid-b".into()),
                },
                prefixes: vec![],
            }],
            peering_claim_refs: vec![],
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["providerId"], "vni-42");
        assert_eq!(json["peerings"][0]["networkRef"]["uid"], "uid-b");
        assert!(json.get("peeringClaimRefs").is_none());
    }
}
