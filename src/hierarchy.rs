//! Builds hierarchical PATCH bodies.
//!
//! Every change for one resource is sent as a single tree rooted at `OrgRoot`
//! (VPC deployments) or `Infra` (domain deployments). Intermediate levels are
//! `ChildResourceReference` nodes. Siblings with the same target type and ID
//! are merged, and children keep the order in which they were first inserted.

use crate::{
    error::Error,
    model::{Child, Group, Root, Rule, SecurityPolicy, SubnetConnectionBindingMap},
};
use ahash::AHashMap;
use std::fmt;

/// Where policy objects live in the remote hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hierarchy {
    /// `/infra/domains/<domain>`
    Domain(String),
    /// `/orgs/<org>/projects/<project>/vpcs/<vpc>`
    Vpc {
        org: String,
        project: String,
        vpc: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RootKind {
    Org,
    Infra,
}

/// Accumulates leaves under their parent paths and renders a [`Root`].
#[derive(Debug)]
pub struct PatchTree {
    kind: RootKind,
    root: HNode,
}

#[derive(Debug, Default)]
struct HNode {
    entries: Vec<Entry>,
    /// Maps (target type, ID) to the position of a reference node in `entries`.
    by_key: AHashMap<(&'static str, String), usize>,
}

#[derive(Debug)]
enum Entry {
    Node {
        target_type: &'static str,
        id: String,
        node: HNode,
    },
    Leaf(Child),
}

/// Path collection segments and the target types of the nodes they name.
const TARGET_TYPES: &[(&str, &str)] = &[
    ("domains", "Domain"),
    ("orgs", "Org"),
    ("projects", "Project"),
    ("vpcs", "Vpc"),
    ("subnets", "VpcSubnet"),
];

// === impl Hierarchy ===

impl Hierarchy {
    /// Parses a VPC path of the form `/orgs/<org>/projects/<project>/vpcs/<vpc>`.
    pub fn from_vpc_path(path: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidPath(path.to_string());
        match path.trim_end_matches('/').split('/').collect::<Vec<_>>()[..] {
            ["", "orgs", org, "projects", project, "vpcs", vpc]
                if !org.is_empty() && !project.is_empty() && !vpc.is_empty() =>
            {
                Ok(Self::Vpc {
                    org: org.to_string(),
                    project: project.to_string(),
                    vpc: vpc.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }

    pub fn root_kind(&self) -> RootKind {
        match self {
            Self::Domain(_) => RootKind::Infra,
            Self::Vpc { .. } => RootKind::Org,
        }
    }

    /// The path under which groups and policies are created.
    pub fn base_path(&self) -> String {
        self.to_string()
    }

    pub fn group_path(&self, id: &str) -> String {
        format!("{self}/groups/{id}")
    }

    pub fn policy_path(&self, id: &str) -> String {
        format!("{self}/security-policies/{id}")
    }

    pub fn rule_path(&self, policy_id: &str, rule_id: &str) -> String {
        format!("{}/rules/{rule_id}", self.policy_path(policy_id))
    }

    fn segments(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Domain(domain) => vec![("Domain", domain.clone())],
            Self::Vpc { org, project, vpc } => vec![
                ("Org", org.clone()),
                ("Project", project.clone()),
                ("Vpc", vpc.clone()),
            ],
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(domain) => write!(f, "/infra/domains/{domain}"),
            Self::Vpc { org, project, vpc } => {
                write!(f, "/orgs/{org}/projects/{project}/vpcs/{vpc}")
            }
        }
    }
}

// === impl PatchTree ===

impl PatchTree {
    pub fn new(kind: RootKind) -> Self {
        Self {
            kind,
            root: HNode::default(),
        }
    }

    /// Inserts `leaf` beneath the node named by a parent path such as
    /// `/orgs/o1/projects/p1/vpcs/v1/subnets/s1`.
    pub fn insert_at_path(&mut self, parent_path: &str, leaf: Child) -> Result<(), Error> {
        let (kind, segments) = parse_path(parent_path)?;
        if kind != self.kind {
            return Err(Error::InvalidPath(parent_path.to_string()));
        }
        self.root.node_mut(&segments).push_leaf(leaf);
        Ok(())
    }

    fn insert(&mut self, segments: &[(&'static str, String)], leaf: Child) {
        self.root.node_mut(segments).push_leaf(leaf);
    }

    pub fn is_empty(&self) -> bool {
        self.root.entries.is_empty()
    }

    pub fn into_root(self) -> Root {
        let children = self.root.into_children();
        match self.kind {
            RootKind::Org => Root::OrgRoot { children },
            RootKind::Infra => Root::Infra { children },
        }
    }
}

fn parse_path(path: &str) -> Result<(RootKind, Vec<(&'static str, String)>), Error> {
    let invalid = || Error::InvalidPath(path.to_string());
    let mut parts = path.trim_end_matches('/').split('/');
    if parts.next() != Some("") {
        return Err(invalid());
    }
    let mut kind = RootKind::Org;
    let mut segments = Vec::new();
    while let Some(collection) = parts.next() {
        if collection == "infra" && segments.is_empty() && kind == RootKind::Org {
            kind = RootKind::Infra;
            continue;
        }
        let target_type = TARGET_TYPES
            .iter()
            .find(|(c, _)| *c == collection)
            .map(|(_, t)| *t)
            .ok_or_else(invalid)?;
        let id = parts.next().filter(|id| !id.is_empty()).ok_or_else(invalid)?;
        segments.push((target_type, id.to_string()));
    }
    if segments.is_empty() {
        return Err(invalid());
    }
    Ok((kind, segments))
}

// === impl HNode ===

impl HNode {
    fn node_mut(&mut self, segments: &[(&'static str, String)]) -> &mut HNode {
        let ((target_type, id), rest) = match segments.split_first() {
            Some(first) => first,
            None => return self,
        };
        let key = (*target_type, id.clone());
        let idx = match self.by_key.get(&key) {
            Some(idx) => *idx,
            None => {
                let idx = self.entries.len();
                self.entries.push(Entry::Node {
                    target_type: *target_type,
                    id: id.clone(),
                    node: HNode::default(),
                });
                self.by_key.insert(key, idx);
                idx
            }
        };
        match &mut self.entries[idx] {
            Entry::Node { node, .. } => node.node_mut(rest),
            // `by_key` only indexes reference nodes.
            Entry::Leaf(_) => unreachable!("leaf indexed as a reference node"),
        }
    }

    fn push_leaf(&mut self, leaf: Child) {
        self.entries.push(Entry::Leaf(leaf));
    }

    fn into_children(self) -> Vec<Child> {
        self.entries
            .into_iter()
            .map(|entry| match entry {
                Entry::Node {
                    target_type,
                    id,
                    node,
                } => Child::ChildResourceReference {
                    id,
                    target_type: target_type.to_string(),
                    children: node.into_children(),
                },
                Entry::Leaf(leaf) => leaf,
            })
            .collect()
    }
}

// === impl Child ===

impl Child {
    pub fn group(group: Group) -> Self {
        let marked_for_delete = group.marked_for_delete;
        Self::ChildGroup {
            group,
            marked_for_delete,
        }
    }

    pub fn rule(rule: Rule) -> Self {
        let marked_for_delete = rule.marked_for_delete;
        Self::ChildRule {
            rule,
            marked_for_delete,
        }
    }

    pub fn security_policy(security_policy: SecurityPolicy) -> Self {
        let marked_for_delete = security_policy.marked_for_delete;
        Self::ChildSecurityPolicy {
            security_policy,
            marked_for_delete,
        }
    }

    pub fn binding_map(binding_map: SubnetConnectionBindingMap) -> Self {
        let marked_for_delete = binding_map.marked_for_delete;
        Self::ChildSubnetConnectionBindingMap {
            binding_map,
            marked_for_delete,
        }
    }
}

/// Wraps a policy with its rules and groups into one PATCH body.
///
/// Rules are nested under the policy. Groups precede the policy so that the
/// policy's references resolve.
pub fn wrap_security_policy(
    hierarchy: &Hierarchy,
    mut policy: SecurityPolicy,
    rules: Vec<Rule>,
    groups: Vec<Group>,
) -> Root {
    policy.children = rules.into_iter().map(Child::rule).collect();
    let segments = hierarchy.segments();
    let mut tree = PatchTree::new(hierarchy.root_kind());
    for group in groups {
        tree.insert(&segments, Child::group(group));
    }
    tree.insert(&segments, Child::security_policy(policy));
    tree.into_root()
}

/// Wraps groups without a policy, e.g. shared groups being deleted.
pub fn wrap_groups(hierarchy: &Hierarchy, groups: Vec<Group>) -> Root {
    let segments = hierarchy.segments();
    let mut tree = PatchTree::new(hierarchy.root_kind());
    for group in groups {
        tree.insert(&segments, Child::group(group));
    }
    tree.into_root()
}

/// Wraps binding maps beneath the subnets named by their parent paths.
pub fn wrap_binding_maps(maps: Vec<SubnetConnectionBindingMap>) -> Result<Root, Error> {
    let mut tree = PatchTree::new(RootKind::Org);
    for map in maps {
        let parent = map
            .parent_path
            .clone()
            .ok_or_else(|| Error::InvalidPath(format!("{} has no parent path", map.id)))?;
        tree.insert_at_path(&parent, Child::binding_map(map))?;
    }
    Ok(tree.into_root())
}
