//! NetworkInterface Custom Resource Definition
//!
//! A NetworkInterface attaches a compute resource to a Network. Its IPs come
//! either from literal values or from ephemeral Prefix children; its optional
//! virtual IP comes from a referenced or ephemeral VirtualIp.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ip::{PrefixSpec, VirtualIpSpec};
use super::types::{Condition, LocalRef, TemplateMetadata};

/// NetworkInterface defines a network attachment.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.netorch.io",
    version = "v1alpha1",
    kind = "NetworkInterface",
    plural = "networkinterfaces",
    shortname = "nic",
    status = "NetworkInterfaceStatus",
    namespaced,
    printcolumn = r#"{"name": "Network", "type": "string", "jsonPath": ".spec.networkRef.name"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    pub network_ref: LocalRef,

    #[serde(default)]
    pub ips: Vec<IpSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<VirtualIpSource>,

    /// Compute resource this interface is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ref: Option<LocalRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Source of one interface IP. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralPrefixSource>,
}

impl IpSource {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ephemeral: None,
        }
    }

    pub fn ephemeral(template: PrefixTemplate) -> Self {
        Self {
            value: None,
            ephemeral: Some(EphemeralPrefixSource {
                prefix_template: template,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPrefixSource {
    pub prefix_template: PrefixTemplate,
}

/// Template for an ephemeral Prefix child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: PrefixSpec,
}

/// Source of the interface's virtual IP. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIpSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip_ref: Option<LocalRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralVirtualIpSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralVirtualIpSource {
    pub virtual_ip_template: VirtualIpTemplate,
}

/// Template for an ephemeral VirtualIp child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIpTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: VirtualIpSpec,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceStatus {
    #[serde(default)]
    pub state: NetworkInterfaceState,

    /// Effective IPs, in the order of `spec.ips`
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NetworkInterfaceState {
    #[default]
    Pending,
    Available,
    Error,
}

impl NetworkInterface {
    /// Name of the ephemeral Prefix backing `spec.ips[index]`.
    pub fn ephemeral_prefix_name(&self, index: usize) -> String {
        format!("{}-{}", self.metadata.name.as_deref().unwrap_or_default(), index)
    }

    /// Name of the ephemeral VirtualIp.
    pub fn ephemeral_virtual_ip_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Name of the referenced (non-ephemeral) virtual IP, if any.
    pub fn virtual_ip_ref_name(&self) -> Option<&str> {
        self.spec
            .virtual_ip
            .as_ref()
            .and_then(|v| v.virtual_ip_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    /// Effective IPs reported in status.
    pub fn status_ips(&self) -> &[String] {
        self.status.as_ref().map(|s| s.ips.as_slice()).unwrap_or(&[])
    }

    pub fn has_virtual_ip(&self) -> bool {
        self.spec.virtual_ip.is_some()
    }
}
