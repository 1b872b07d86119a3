use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU16};

/// Describes firewall rules applied to a set of workloads.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.nsx.vmware.com",
    version = "v1alpha1",
    kind = "SecurityPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicySpec {
    #[serde(default)]
    pub applied_to: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub priority: i64,
}

/// Selects the workloads a policy or rule is enforced on.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub vm_selector: Option<LabelSelector>,
    pub pod_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// One of `Allow`, `Drop` or `Reject` (case-insensitive).
    pub action: String,
    /// One of `In`, `Ingress`, `Out` or `Egress` (case-insensitive).
    pub direction: String,
    pub name: Option<String>,
    #[serde(default)]
    pub applied_to: Vec<Target>,
    #[serde(default)]
    pub sources: Vec<Peer>,
    #[serde(default)]
    pub destinations: Vec<Peer>,
    #[serde(default)]
    pub ports: Vec<SecurityPolicyPort>,
}

/// A rule source or destination.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub vm_selector: Option<LabelSelector>,
    pub pod_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<IpBlock>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IpBlock {
    pub cidr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyPort {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// When unset, every port of `protocol` matches.
    pub port: Option<Port>,
    pub end_port: Option<NonZeroU16>,
}

/// References a container port by name or number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum Port {
    Number(NonZeroU16),
    Name(String),
}

fn default_protocol() -> String {
    "TCP".to_string()
}

// === impl Port ===

impl Port {
    pub fn is_named(&self) -> bool {
        matches!(self, Port::Name(_))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(n) => fmt::Display::fmt(n, f),
            Port::Name(n) => fmt::Display::fmt(n, f),
        }
    }
}

// === impl SecurityPolicyPort ===

impl SecurityPolicyPort {
    pub fn is_named(&self) -> bool {
        self.port.as_ref().map_or(false, Port::is_named)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ports_by_number_and_name() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "action": "allow",
            "direction": "in",
            "ports": [
                { "port": 80 },
                { "protocol": "UDP", "port": "dns" },
                { "port": 8000, "endPort": 8080 },
            ],
        }))
        .unwrap();

        assert_eq!(rule.ports.len(), 3);
        assert_eq!(rule.ports[0].protocol, "TCP");
        assert_eq!(
            rule.ports[0].port,
            Some(Port::Number(NonZeroU16::new(80).unwrap()))
        );
        assert!(rule.ports[1].is_named());
        assert_eq!(rule.ports[1].protocol, "UDP");
        assert_eq!(rule.ports[2].end_port, NonZeroU16::new(8080));
        assert!(rule.sources.is_empty());
    }
}
