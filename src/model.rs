//! The remote control plane's policy object model.
//!
//! Field names follow the remote API's JSON encoding so that values can be
//! serialized directly into PATCH bodies and deserialized from search results.

use serde::{Deserialize, Serialize};

pub const ANY: &str = "ANY";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub tag: String,
}

/// A group membership expression.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Expression {
    Condition(Condition),
    ConjunctionOperator(ConjunctionOperator),
    NestedExpression(NestedExpression),
    #[serde(rename = "IPAddressExpression")]
    IpAddressExpression(IpAddressExpression),
}

/// Matches members of `member_type` carrying a tag, encoded as `scope|tag`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub key: String,
    pub member_type: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_operator: Option<String>,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConjunctionOperator {
    pub conjunction_operator: Conjunction,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedExpression {
    #[serde(default)]
    pub expressions: Vec<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressExpression {
    pub ip_addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub expression: Vec<Expression>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Drop,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub resource_type: String,
    pub l4_protocol: String,
    #[serde(default)]
    pub source_ports: Vec<String>,
    #[serde(default)]
    pub destination_ports: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub direction: Direction,
    pub action: Action,
    pub sequence_number: i64,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub source_groups: Vec<String>,
    #[serde(default)]
    pub destination_groups: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub service_entries: Vec<ServiceEntry>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub sequence_number: i64,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Rules are carried as hierarchical children only when patching.
    #[serde(default, skip_serializing_if = "Vec::is_empty", skip_deserializing)]
    pub children: Vec<Child>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Binds a subnet to a parent subnet for VLAN-tagged traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConnectionBindingMap {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// The path of the subnet this binding connects.
    pub subnet_path: String,
    #[serde(default)]
    pub vlan_traffic_tag: i64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// The path of the subnet the binding lives under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "_revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// A hierarchical PATCH envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Child {
    ChildResourceReference {
        id: String,
        target_type: String,
        #[serde(default)]
        children: Vec<Child>,
    },
    ChildSecurityPolicy {
        #[serde(rename = "SecurityPolicy")]
        security_policy: SecurityPolicy,
        marked_for_delete: bool,
    },
    ChildRule {
        #[serde(rename = "Rule")]
        rule: Rule,
        marked_for_delete: bool,
    },
    ChildGroup {
        #[serde(rename = "Group")]
        group: Group,
        marked_for_delete: bool,
    },
    ChildSubnetConnectionBindingMap {
        #[serde(rename = "SubnetConnectionBindingMap")]
        binding_map: SubnetConnectionBindingMap,
        marked_for_delete: bool,
    },
}

/// The root of a hierarchical PATCH body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Root {
    /// Addresses `/orgs/...` (VPC deployments).
    OrgRoot { children: Vec<Child> },
    /// Addresses `/infra/domains/...`.
    Infra { children: Vec<Child> },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub result_count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedEntity {
    #[serde(default)]
    pub entity_type: String,
    pub state: String,
    #[serde(default)]
    pub alarms: Vec<RealizedAlarm>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedAlarm {
    #[serde(default)]
    pub message: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

// === impl Tag ===

impl Tag {
    pub fn new(scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: tag.into(),
        }
    }
}

/// Finds the value of the first tag with the given scope.
pub fn tag_value<'t>(tags: &'t [Tag], scope: &str) -> Option<&'t str> {
    tags.iter()
        .find(|t| t.scope == scope)
        .map(|t| t.tag.as_str())
}

// === impl ServiceEntry ===

impl ServiceEntry {
    pub fn l4_port_set(protocol: impl Into<String>, destination_ports: Vec<String>) -> Self {
        Self {
            resource_type: "L4PortSetServiceEntry".to_string(),
            l4_protocol: protocol.into(),
            source_ports: Vec::new(),
            destination_ports,
        }
    }
}

// Remote-assigned fields (path, revision) and tag ordering are ignored when
// deciding whether an object needs to be re-patched.

impl Group {
    pub fn comparable(&self) -> Self {
        let mut tags = self.tags.clone();
        tags.sort();
        Self {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            expression: self.expression.clone(),
            tags,
            ..Default::default()
        }
    }
}

impl Rule {
    pub fn comparable(&self) -> Self {
        let mut tags = self.tags.clone();
        tags.sort();
        Self {
            tags,
            path: None,
            parent_path: None,
            revision: None,
            marked_for_delete: false,
            ..self.clone()
        }
    }
}

impl SecurityPolicy {
    pub fn comparable(&self) -> Self {
        let mut tags = self.tags.clone();
        tags.sort();
        Self {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            sequence_number: self.sequence_number,
            scope: self.scope.clone(),
            tags,
            ..Default::default()
        }
    }
}

impl SubnetConnectionBindingMap {
    pub fn comparable(&self) -> Self {
        let mut tags = self.tags.clone();
        tags.sort();
        Self {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            subnet_path: self.subnet_path.clone(),
            vlan_traffic_tag: self.vlan_traffic_tag,
            tags,
            parent_path: self.parent_path.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_expression_encoding() {
        let group = Group {
            id: "g".to_string(),
            display_name: "g".to_string(),
            expression: vec![
                Expression::NestedExpression(NestedExpression {
                    expressions: vec![Expression::Condition(Condition {
                        key: "Tag".to_string(),
                        member_type: "SegmentPort".to_string(),
                        operator: "EQUALS".to_string(),
                        scope_operator: None,
                        value: "app|web".to_string(),
                    })],
                }),
                Expression::ConjunctionOperator(ConjunctionOperator {
                    conjunction_operator: Conjunction::Or,
                }),
                Expression::IpAddressExpression(IpAddressExpression {
                    ip_addresses: vec!["10.0.0.0/24".to_string()],
                }),
            ],
            ..Default::default()
        };

        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["expression"][0]["resource_type"], "NestedExpression");
        assert_eq!(
            json["expression"][0]["expressions"][0]["value"],
            "app|web"
        );
        assert_eq!(json["expression"][1]["conjunction_operator"], "OR");
        assert_eq!(json["expression"][2]["resource_type"], "IPAddressExpression");
        assert!(json.get("marked_for_delete").is_none());
        assert!(json.get("_revision").is_none());

        let parsed: Group = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, group);
    }

    #[test]
    fn comparable_ignores_remote_fields() {
        let local = Group {
            id: "g".to_string(),
            tags: vec![Tag::new("b", "2"), Tag::new("a", "1")],
            ..Default::default()
        };
        let remote = Group {
            tags: vec![Tag::new("a", "1"), Tag::new("b", "2")],
            path: Some("/infra/domains/default/groups/g".to_string()),
            revision: Some(3),
            ..local.clone()
        };
        assert_ne!(local, remote);
        assert_eq!(local.comparable(), remote.comparable());
    }
}
