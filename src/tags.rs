//! Deterministic identifiers and ownership tags for generated objects.
//!
//! The ID grammar is `sp_<UID>[_<ruleIdx>[_scope|_src|_dst]]` for groups and
//! policies, and `sp_<UID>_<ruleIdx>[_<portIdx>_<pairIdx>]` for rules. The
//! store's CR UID index and garbage collection both depend on it.

use crate::{k8s, model::Tag};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};

pub const SCOPE_CLUSTER: &str = "nsx-op/cluster";
pub const SCOPE_NAMESPACE: &str = "nsx-op/namespace";
pub const SCOPE_CR_NAME: &str = "nsx-op/security_policy_cr_name";
pub const SCOPE_CR_UID: &str = "nsx-op/security_policy_cr_uid";
pub const SCOPE_GROUP_TYPE: &str = "nsx-op/group_type";
pub const SCOPE_RULE_ID: &str = "nsx-op/rule_id";
pub const SCOPE_SELECTOR_HASH: &str = "nsx-op/selector_hash";
pub const SCOPE_SUBNET_BINDING_CR_NAME: &str = "nsx-op/subnetbinding_cr_name";
pub const SCOPE_SUBNET_BINDING_CR_UID: &str = "nsx-op/subnetbinding_cr_uid";

const ID_PREFIX: &str = "sp";

/// Identifies the resource that owns generated objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Which per-rule group an ID or tag refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Scope,
    Source,
    Destination,
}

/// Maps live custom resource UIDs to the internal UIDs their policies are
/// tagged with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdScheme {
    /// A `SecurityPolicy` is tagged with its own UID.
    SecurityPolicy,
    /// A `NetworkPolicy` produces an allow and an isolation policy.
    NetworkPolicy,
}

// === impl Owner ===

impl Owner {
    pub fn from_policy(policy: &k8s::SecurityPolicy) -> Result<Self, crate::Error> {
        use k8s::ResourceExt;

        let name = policy.metadata.name.clone();
        let namespace = policy.namespace();
        let uid = policy.uid();
        match (namespace, name, uid) {
            (Some(namespace), Some(name), Some(uid)) => Ok(Self {
                namespace,
                name,
                uid,
            }),
            (ns, name, _) => Err(crate::Error::MissingMetadata(format!(
                "{}/{}",
                ns.unwrap_or_default(),
                name.unwrap_or_default()
            ))),
        }
    }

    /// Tags carried by every object generated for this owner.
    pub fn basic_tags(&self, cluster: &str) -> Vec<Tag> {
        vec![
            Tag::new(SCOPE_CLUSTER, cluster),
            Tag::new(SCOPE_NAMESPACE, &self.namespace),
            Tag::new(SCOPE_CR_NAME, &self.name),
            Tag::new(SCOPE_CR_UID, &self.uid),
        ]
    }

    /// Tags for a scope (applied-to) group. `rule_idx` is set for per-rule
    /// groups.
    pub fn target_tags(
        &self,
        cluster: &str,
        targets: &[k8s::Target],
        rule_idx: Option<usize>,
    ) -> Vec<Tag> {
        let mut tags = vec![
            Tag::new(SCOPE_GROUP_TYPE, "scope"),
            Tag::new(SCOPE_SELECTOR_HASH, targets_hash(targets)),
        ];
        tags.extend(self.basic_tags(cluster));
        if let Some(idx) = rule_idx {
            tags.push(Tag::new(SCOPE_RULE_ID, self.rule_tag(idx)));
        }
        tags
    }

    /// Tags for a per-rule source or destination group.
    pub fn peer_tags(
        &self,
        cluster: &str,
        peers: &[k8s::Peer],
        rule_idx: usize,
        kind: GroupKind,
    ) -> Vec<Tag> {
        let group_type = match kind {
            GroupKind::Scope => "scope",
            GroupKind::Source => "source",
            GroupKind::Destination => "destination",
        };
        let mut tags = vec![
            Tag::new(SCOPE_GROUP_TYPE, group_type),
            Tag::new(SCOPE_RULE_ID, self.rule_tag(rule_idx)),
        ];
        tags.extend(self.basic_tags(cluster));
        tags.push(Tag::new(SCOPE_SELECTOR_HASH, peers_hash(peers)));
        tags
    }

    /// Tags for the IP-set group synthesized by named-port resolution.
    pub fn ip_set_tags(&self, cluster: &str, rule_idx: usize) -> Vec<Tag> {
        let mut tags = vec![
            Tag::new(SCOPE_GROUP_TYPE, "destination"),
            Tag::new(SCOPE_RULE_ID, self.rule_tag(rule_idx)),
        ];
        tags.extend(self.basic_tags(cluster));
        tags
    }

    fn rule_tag(&self, rule_idx: usize) -> String {
        format!("{}_{}", self.uid, rule_idx)
    }

    pub fn policy_id(&self) -> String {
        policy_id(&self.uid)
    }

    pub fn policy_scope_group_id(&self) -> String {
        format!("{}_scope", self.policy_id())
    }

    pub fn rule_group_id(&self, rule_idx: usize, kind: GroupKind) -> String {
        let suffix = match kind {
            GroupKind::Scope => "scope",
            GroupKind::Source => "src",
            GroupKind::Destination => "dst",
        };
        format!("{}_{}_{}", self.policy_id(), rule_idx, suffix)
    }

    pub fn rule_id(&self, rule_idx: usize) -> String {
        format!("{}_{}", self.policy_id(), rule_idx)
    }

    /// The ID of a rule produced by expanding a named port.
    pub fn expanded_rule_id(&self, rule_idx: usize, port_idx: usize, pair_idx: usize) -> String {
        format!("{}_{}_{}_{}", self.policy_id(), rule_idx, port_idx, pair_idx)
    }
}

pub fn policy_id(cr_uid: &str) -> String {
    format!("{ID_PREFIX}_{cr_uid}")
}

pub fn ip_set_group_id(rule_id: &str) -> String {
    format!("{rule_id}_ipset")
}

// === impl IdScheme ===

impl IdScheme {
    /// The internal UIDs expected to be present for a live resource.
    pub fn expected_uids(&self, cr_uid: &str) -> Vec<String> {
        match self {
            Self::SecurityPolicy => vec![cr_uid.to_string()],
            Self::NetworkPolicy => {
                vec![allow_uid(cr_uid), isolation_uid(cr_uid)]
            }
        }
    }
}

pub fn allow_uid(cr_uid: &str) -> String {
    format!("{cr_uid}_allow")
}

pub fn isolation_uid(cr_uid: &str) -> String {
    format!("{cr_uid}_isolation")
}

const ALLOW_SUFFIX: &str = "_allow";
const ISOLATION_SUFFIX: &str = "_isolation";

/// Returns the `NetworkPolicy` UID an internal UID was derived from, if any.
pub fn network_policy_uid(internal_uid: &str) -> Option<&str> {
    internal_uid
        .strip_suffix(ALLOW_SUFFIX)
        .or_else(|| internal_uid.strip_suffix(ISOLATION_SUFFIX))
}

/// Tags for a subnet connection binding map owned by a binding resource.
pub fn binding_tags(cluster: &str, namespace: &str, name: &str, uid: &str) -> Vec<Tag> {
    vec![
        Tag::new(SCOPE_CLUSTER, cluster),
        Tag::new(SCOPE_NAMESPACE, namespace),
        Tag::new(SCOPE_SUBNET_BINDING_CR_NAME, name),
        Tag::new(SCOPE_SUBNET_BINDING_CR_UID, uid),
    ]
}

/// The ID of the binding map placed under `subnet_path` for the resource
/// `name`.
pub fn binding_map_id(name: &str, subnet_path: &str) -> String {
    let hash = sha1_hex(&subnet_path);
    format!("{name}_{}", &hash[..8])
}

// === selector hashing ===

/// An order-independent rendering of a label selector.
#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct CanonicalSelector<'s> {
    labels: BTreeMap<&'s str, &'s str>,
    expressions: BTreeSet<(&'s str, &'s str, BTreeSet<&'s str>)>,
}

fn canonical(selector: Option<&k8s::LabelSelector>) -> Option<CanonicalSelector<'_>> {
    let selector = selector?;
    let labels = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|e| {
            let values = e.values.iter().flatten().map(String::as_str).collect();
            (e.key.as_str(), e.operator.as_str(), values)
        })
        .collect();
    Some(CanonicalSelector {
        labels,
        expressions,
    })
}

fn targets_hash(targets: &[k8s::Target]) -> String {
    let canonical = targets
        .iter()
        .map(|t| {
            (
                canonical(t.vm_selector.as_ref()),
                canonical(t.pod_selector.as_ref()),
            )
        })
        .collect::<BTreeSet<_>>();
    sha1_hex(&canonical)
}

fn peers_hash(peers: &[k8s::Peer]) -> String {
    let canonical = peers
        .iter()
        .map(|p| {
            let blocks = p
                .ip_blocks
                .iter()
                .map(|b| b.cidr.as_str())
                .collect::<BTreeSet<_>>();
            (
                canonical(p.vm_selector.as_ref()),
                canonical(p.pod_selector.as_ref()),
                canonical(p.namespace_selector.as_ref()),
                blocks,
            )
        })
        .collect::<BTreeSet<_>>();
    sha1_hex(&canonical)
}

fn sha1_hex<T: Serialize>(value: &T) -> String {
    // Serializing maps and sets of strings cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha1::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn owner() -> Owner {
        Owner {
            namespace: "ns-0".to_string(),
            name: "sp-0".to_string(),
            uid: "uid-0".to_string(),
        }
    }

    fn selector(labels: &[(&str, &str)], exprs: Vec<(&str, &str, Vec<&str>)>) -> k8s::LabelSelector {
        k8s::LabelSelector {
            match_labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: Some(
                exprs
                    .into_iter()
                    .map(|(key, op, values)| k8s::LabelSelectorRequirement {
                        key: key.to_string(),
                        operator: op.to_string(),
                        values: Some(values.into_iter().map(String::from).collect()),
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn ids_follow_grammar() {
        let o = owner();
        assert_eq!(o.policy_id(), "sp_uid-0");
        assert_eq!(o.policy_scope_group_id(), "sp_uid-0_scope");
        assert_eq!(o.rule_group_id(2, GroupKind::Scope), "sp_uid-0_2_scope");
        assert_eq!(o.rule_group_id(2, GroupKind::Source), "sp_uid-0_2_src");
        assert_eq!(o.rule_group_id(2, GroupKind::Destination), "sp_uid-0_2_dst");
        assert_eq!(o.rule_id(1), "sp_uid-0_1");
        assert_eq!(o.expanded_rule_id(1, 0, 3), "sp_uid-0_1_0_3");
        assert_eq!(ip_set_group_id("sp_uid-0_1_0_3"), "sp_uid-0_1_0_3_ipset");
    }

    #[test]
    fn tag_layouts() {
        let o = owner();
        let basic = o.basic_tags("cl");
        assert_eq!(
            basic,
            vec![
                Tag::new(SCOPE_CLUSTER, "cl"),
                Tag::new(SCOPE_NAMESPACE, "ns-0"),
                Tag::new(SCOPE_CR_NAME, "sp-0"),
                Tag::new(SCOPE_CR_UID, "uid-0"),
            ]
        );

        let target = o.target_tags("cl", &[k8s::Target::default()], Some(3));
        assert_eq!(target[0], Tag::new(SCOPE_GROUP_TYPE, "scope"));
        assert_eq!(target[1].scope, SCOPE_SELECTOR_HASH);
        assert_eq!(&target[2..6], &basic[..]);
        assert_eq!(target[6], Tag::new(SCOPE_RULE_ID, "uid-0_3"));

        let policy_level = o.target_tags("cl", &[k8s::Target::default()], None);
        assert_eq!(policy_level.len(), 6);

        let peer = o.peer_tags("cl", &[k8s::Peer::default()], 1, GroupKind::Source);
        assert_eq!(peer[0], Tag::new(SCOPE_GROUP_TYPE, "source"));
        assert_eq!(peer[1], Tag::new(SCOPE_RULE_ID, "uid-0_1"));
        assert_eq!(&peer[2..6], &basic[..]);
        assert_eq!(peer[6].scope, SCOPE_SELECTOR_HASH);
    }

    #[test]
    fn selector_hash_is_order_independent() {
        let a = k8s::Target {
            pod_selector: Some(selector(
                &[("app", "web"), ("tier", "fe")],
                vec![("env", "In", vec!["prod", "dev"])],
            )),
            vm_selector: None,
        };
        let b = k8s::Target {
            pod_selector: Some(selector(
                &[("tier", "fe"), ("app", "web")],
                vec![("env", "In", vec!["dev", "prod"])],
            )),
            vm_selector: None,
        };
        let c = k8s::Target {
            pod_selector: Some(k8s::LabelSelector {
                match_labels: Some(btreemap! { "app".to_string() => "db".to_string() }),
                match_expressions: None,
            }),
            vm_selector: None,
        };

        assert_eq!(targets_hash(&[a.clone()]), targets_hash(&[b.clone()]));
        assert_eq!(
            targets_hash(&[a.clone(), c.clone()]),
            targets_hash(&[c.clone(), a.clone()])
        );
        assert_ne!(targets_hash(&[a]), targets_hash(&[c]));
    }

    #[test]
    fn network_policy_uids_round_trip() {
        assert_eq!(network_policy_uid(&allow_uid("uidA")), Some("uidA"));
        assert_eq!(network_policy_uid(&isolation_uid("uidA")), Some("uidA"));
        assert_eq!(network_policy_uid("uidA"), None);
    }

    #[test]
    fn binding_map_ids_are_stable() {
        let a = binding_map_id("bm", "/orgs/o/projects/p/vpcs/v/subnets/s1");
        assert_eq!(a, binding_map_id("bm", "/orgs/o/projects/p/vpcs/v/subnets/s1"));
        assert_ne!(a, binding_map_id("bm", "/orgs/o/projects/p/vpcs/v/subnets/s2"));
        assert!(a.starts_with("bm_"));
        assert_eq!(a.len(), "bm_".len() + 8);
    }

    #[test]
    fn network_policy_uids() {
        assert_eq!(
            IdScheme::NetworkPolicy.expected_uids("uidA"),
            vec!["uidA_allow".to_string(), "uidA_isolation".to_string()]
        );
        assert_eq!(
            IdScheme::SecurityPolicy.expected_uids("uidA"),
            vec!["uidA".to_string()]
        );
    }
}
