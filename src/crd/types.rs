//! Shared types used across the networking CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

// =============================================================================
// References
// =============================================================================

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalRef {
    pub name: String,
}

impl LocalRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// UID-pinned reference, written by the party that claims the referent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub name: String,
    pub uid: String,
}

impl ClaimRef {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
        }
    }
}

// =============================================================================
// IP Families
// =============================================================================

/// IP address family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum IpFamily {
    IPv4,
    IPv6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::IPv4,
            IpAddr::V6(_) => IpFamily::IPv6,
        }
    }
}

impl Default for IpFamily {
    fn default() -> Self {
        IpFamily::IPv4
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::IPv4 => write!(f, "IPv4"),
            IpFamily::IPv6 => write!(f, "IPv6"),
        }
    }
}

/// Parse the address part of an IP or CIDR string ("10.0.0.1" or "10.0.0.1/32").
pub fn parse_ip(value: &str) -> Option<IpAddr> {
    let addr = value.split('/').next().unwrap_or(value);
    addr.trim().parse().ok()
}

// =============================================================================
// Label Selector
// =============================================================================

/// Kubernetes-style label selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels exactly
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Match expressions
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single label selector requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label selector operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self.match_expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator {
                    LabelSelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
                    LabelSelectorOperator::NotIn => value.map_or(true, |v| !req.values.contains(v)),
                    LabelSelectorOperator::Exists => value.is_some(),
                    LabelSelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}

// =============================================================================
// Ephemeral Templates
// =============================================================================

/// Labels and annotations stamped onto an ephemeral child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// What happens to an ephemeral child when its parent is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReclaimPolicy {
    /// Garbage-collected together with the parent
    #[default]
    Delete,
    /// Survives the parent; only the claim is released
    Retain,
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Status condition
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "Ready", "Allocated")
    pub r#type: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }

    /// Equality ignoring the transition timestamp.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

// Two conditions are the same if only their timestamps differ, so that
// a reconcile with no input change produces no write.
impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.same_state(other)
    }
}

/// Merge freshly computed conditions into the existing set, keeping the
/// previous transition time for conditions whose state did not change.
pub fn merge_conditions(existing: &[Condition], computed: Vec<Condition>) -> Vec<Condition> {
    computed
        .into_iter()
        .map(|mut c| {
            if let Some(prev) = existing.iter().find(|p| p.same_state(&c)) {
                c.last_transition_time = prev.last_transition_time;
            }
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_selector_match_labels() {
        let selector = LabelSelector::from_labels([("app", "web")]);
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_selector_match_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "zone".into(),
                    operator: LabelSelectorOperator::In,
                    values: vec!["a".into(), "b".into()],
                },
                LabelSelectorRequirement {
                    key: "legacy".into(),
                    operator: LabelSelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };

        assert!(selector.matches(&labels(&[("zone", "a")])));
        assert!(!selector.matches(&labels(&[("zone", "c")])));
        assert!(!selector.matches(&labels(&[("zone", "b"), ("legacy", "1")])));
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_ip("10.0.0.1/32"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_ip("fd00::1/128"), Some("fd00::1".parse().unwrap()));
        assert_eq!(parse_ip("not-an-ip"), None);
    }

    #[test]
    fn test_merge_conditions_keeps_transition_time() {
        let mut old = Condition::new("Ready", ConditionStatus::True, "Reconciled", "ok");
        let stamp = Utc::now() - chrono::Duration::hours(1);
        old.last_transition_time = Some(stamp);

        let fresh = Condition::new("Ready", ConditionStatus::True, "Reconciled", "ok");
        let merged = merge_conditions(&[old], vec![fresh]);
        assert_eq!(merged[0].last_transition_time, Some(stamp));

        let changed = Condition::new("Ready", ConditionStatus::False, "NoIPs", "none");
        let merged = merge_conditions(&merged, vec![changed]);
        assert_ne!(merged[0].last_transition_time, Some(stamp));
    }
}
