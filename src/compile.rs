//! Compiles a `SecurityPolicy` resource into remote policy objects.

use crate::{
    error::{Error, SelectorError},
    expr::{self, Counts, GroupExpression, MemberType},
    k8s,
    model::{Action, Direction, Expression, Group, Rule, SecurityPolicy, ServiceEntry, Tag, ANY},
    named_port::{self, PortAddress},
    pod::{NamespaceLister, PodLister},
    tags::{self, GroupKind, Owner},
    Config,
};
use std::{collections::BTreeMap, net::IpAddr};
use tracing::Instrument;

/// The objects produced for one `SecurityPolicy`.
#[derive(Clone, Debug, PartialEq)]
pub struct Compiled {
    pub policy: SecurityPolicy,
    pub rules: Vec<Rule>,
    pub groups: Vec<Group>,
}

pub struct Compiler<'a> {
    config: &'a Config,
    pods: &'a dyn PodLister,
    namespaces: &'a dyn NamespaceLister,
}

/// Per-rule state shared by the base rule and the rules expanded from named
/// ports.
struct RuleBase {
    display_name: String,
    direction: Direction,
    action: Action,
    scope: Vec<String>,
    source_groups: Vec<String>,
    destination_groups: Vec<String>,
}

// === impl Compiler ===

impl<'a> Compiler<'a> {
    pub fn new(
        config: &'a Config,
        pods: &'a dyn PodLister,
        namespaces: &'a dyn NamespaceLister,
    ) -> Self {
        Self {
            config,
            pods,
            namespaces,
        }
    }

    /// Builds the policy, its rules and every group they reference.
    pub async fn build_security_policy(
        &self,
        policy: &k8s::SecurityPolicy,
    ) -> Result<Compiled, Error> {
        let owner = Owner::from_policy(policy)?;
        let span = tracing::info_span!(
            "compile",
            namespace = %owner.namespace,
            name = %owner.name,
        );
        self.build(policy, owner).instrument(span).await
    }

    async fn build(&self, policy: &k8s::SecurityPolicy, owner: Owner) -> Result<Compiled, Error> {
        let hierarchy = &self.config.hierarchy;
        let cluster = &self.config.cluster;
        let policy_id = owner.policy_id();
        let policy_path = hierarchy.policy_path(&policy_id);
        let mut groups = Vec::new();

        let mut scope = vec![ANY.to_string()];
        if let Some(group) = self.target_group(
            &owner,
            owner.policy_scope_group_id(),
            &policy.spec.applied_to,
            None,
        )? {
            scope = vec![group.path.clone().unwrap_or_default()];
            groups.push(group);
        }

        let mut rules = Vec::new();
        for (idx, rule) in policy.spec.rules.iter().enumerate() {
            let (mut built, mut rule_groups) = self
                .build_rule(policy, &owner, &policy_path, idx, rule)
                .await?;
            rules.append(&mut built);
            groups.append(&mut rule_groups);
        }

        let policy = SecurityPolicy {
            id: policy_id.clone(),
            display_name: owner.name.clone(),
            sequence_number: policy.spec.priority,
            scope,
            tags: owner.basic_tags(cluster),
            children: Vec::new(),
            path: Some(policy_path),
            parent_path: Some(hierarchy.base_path()),
            revision: None,
            marked_for_delete: false,
        };
        tracing::debug!(
            policy = %policy.id,
            rules = rules.len(),
            groups = groups.len(),
            "compiled"
        );
        Ok(Compiled {
            policy,
            rules,
            groups,
        })
    }

    async fn build_rule(
        &self,
        policy: &k8s::SecurityPolicy,
        owner: &Owner,
        policy_path: &str,
        idx: usize,
        rule: &k8s::Rule,
    ) -> Result<(Vec<Rule>, Vec<Group>), Error> {
        let direction = parse_direction(&rule.direction)?;
        let action = parse_action(&rule.action)?;
        let mut groups = Vec::new();

        let mut scope = vec![ANY.to_string()];
        if let Some(group) = self.target_group(
            owner,
            owner.rule_group_id(idx, GroupKind::Scope),
            &rule.applied_to,
            Some(idx),
        )? {
            scope = vec![group.path.clone().unwrap_or_default()];
            groups.push(group);
        }

        let mut source_groups = vec![ANY.to_string()];
        let mut destination_groups = vec![ANY.to_string()];
        let (peers, kind, slot) = match direction {
            Direction::In => (&rule.sources, GroupKind::Source, &mut source_groups),
            Direction::Out => (
                &rule.destinations,
                GroupKind::Destination,
                &mut destination_groups,
            ),
        };
        if let Some(group) = self.peer_group(owner, peers, idx, kind)? {
            *slot = vec![group.path.clone().unwrap_or_default()];
            groups.push(group);
        }

        let base = RuleBase {
            display_name: rule
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{idx}", owner.name)),
            direction,
            action,
            scope,
            source_groups,
            destination_groups,
        };

        // Numeric ports share the base rule. Each address set of a named port
        // gets its own rule.
        let mut entries = Vec::new();
        let mut expanded = Vec::new();
        for (port_idx, port) in rule.ports.iter().enumerate() {
            let resolved = named_port::resolve(
                self.pods,
                self.namespaces,
                policy,
                rule,
                direction,
                port,
            )
            .await?;
            if !port.is_named() {
                entries.extend(resolved.iter().map(|pa| service_entry(port, pa)));
                continue;
            }
            for (pair_idx, pa) in resolved.iter().enumerate() {
                let id = owner.expanded_rule_id(idx, port_idx, pair_idx);
                let ip_set = self.ip_set_group(owner, &id, idx, &pa.ips);
                let mut named_rule = self.rule(
                    owner,
                    policy_path,
                    &base,
                    id,
                    format!("{}-{port_idx}-{pair_idx}", base.display_name),
                    idx,
                    vec![service_entry(port, pa)],
                );
                named_rule.destination_groups = vec![ip_set.path.clone().unwrap_or_default()];
                groups.push(ip_set);
                expanded.push(named_rule);
            }
        }

        let mut rules = Vec::with_capacity(expanded.len() + 1);
        if rule.ports.is_empty() || !entries.is_empty() {
            rules.push(self.rule(
                owner,
                policy_path,
                &base,
                owner.rule_id(idx),
                base.display_name.clone(),
                idx,
                entries,
            ));
        }
        rules.extend(expanded);
        Ok((rules, groups))
    }

    #[allow(clippy::too_many_arguments)]
    fn rule(
        &self,
        owner: &Owner,
        policy_path: &str,
        base: &RuleBase,
        id: String,
        display_name: String,
        idx: usize,
        service_entries: Vec<ServiceEntry>,
    ) -> Rule {
        Rule {
            path: Some(format!("{policy_path}/rules/{id}")),
            parent_path: Some(policy_path.to_string()),
            id,
            display_name,
            direction: base.direction,
            action: base.action,
            sequence_number: idx as i64,
            scope: base.scope.clone(),
            source_groups: base.source_groups.clone(),
            destination_groups: base.destination_groups.clone(),
            services: vec![ANY.to_string()],
            service_entries,
            tags: owner.basic_tags(&self.config.cluster),
            revision: None,
            marked_for_delete: false,
        }
    }

    fn group(&self, id: String, expression: Vec<Expression>, tags: Vec<Tag>) -> Group {
        let hierarchy = &self.config.hierarchy;
        Group {
            display_name: id.clone(),
            path: Some(hierarchy.group_path(&id)),
            parent_path: Some(hierarchy.base_path()),
            id,
            expression,
            tags,
            revision: None,
            marked_for_delete: false,
        }
    }

    /// Builds an applied-to group, or `None` if there are no targets.
    fn target_group(
        &self,
        owner: &Owner,
        id: String,
        targets: &[k8s::Target],
        rule_idx: Option<usize>,
    ) -> Result<Option<Group>, Error> {
        let mut expression = GroupExpression::default();
        for target in targets {
            let criterion = match (target.pod_selector.as_ref(), target.vm_selector.as_ref()) {
                (Some(_), Some(_)) => return Err(SelectorError::PodAndVmSelector.into()),
                (Some(pods), None) => selector_criterion(
                    namespace_condition(MemberType::SegmentPort, &owner.namespace),
                    pods,
                    MemberType::SegmentPort,
                )?,
                (None, Some(vms)) => selector_criterion(
                    namespace_condition(MemberType::VirtualMachine, &owner.namespace),
                    vms,
                    MemberType::VirtualMachine,
                )?,
                (None, None) => continue,
            };
            expression.push_criteria(criterion.0, criterion.1)?;
        }
        if expression.is_empty() {
            return Ok(None);
        }
        let tags = owner.target_tags(&self.config.cluster, targets, rule_idx);
        Ok(Some(self.group(id, expression.into_expression(), tags)))
    }

    /// Builds a source or destination group, or `None` if the peers match
    /// anything.
    fn peer_group(
        &self,
        owner: &Owner,
        peers: &[k8s::Peer],
        rule_idx: usize,
        kind: GroupKind,
    ) -> Result<Option<Group>, Error> {
        let mut expression = GroupExpression::default();
        let mut ip_addresses = Vec::new();
        for peer in peers {
            for block in &peer.ip_blocks {
                ip_addresses.push(validate_ip_block(&block.cidr)?);
            }
            let criterion = match (
                peer.pod_selector.as_ref(),
                peer.vm_selector.as_ref(),
                peer.namespace_selector.as_ref(),
            ) {
                (Some(_), Some(_), _) => return Err(SelectorError::PodAndVmSelector.into()),
                (_, Some(_), Some(_)) => {
                    return Err(SelectorError::VmAndNamespaceSelector.into())
                }
                (Some(pods), None, None) => selector_criterion(
                    namespace_condition(MemberType::SegmentPort, &owner.namespace),
                    pods,
                    MemberType::SegmentPort,
                )?,
                (None, Some(vms), None) => selector_criterion(
                    namespace_condition(MemberType::VirtualMachine, &owner.namespace),
                    vms,
                    MemberType::VirtualMachine,
                )?,
                (None, None, Some(namespaces)) => {
                    let exprs = selector_parts(namespaces).1;
                    expr::validate_ns_selector_op_not_in(&exprs)?;
                    selector_criterion(
                        cluster_condition(MemberType::Segment, &self.config.cluster),
                        namespaces,
                        MemberType::Segment,
                    )?
                }
                (Some(pods), None, Some(namespaces)) => mixed_criterion(
                    cluster_condition(MemberType::Segment, &self.config.cluster),
                    namespaces,
                    pods,
                )?,
                (None, None, None) => continue,
            };
            expression.push_criteria(criterion.0, criterion.1)?;
        }
        expression.push_ip_addresses(ip_addresses);
        if expression.is_empty() {
            return Ok(None);
        }

        let id = owner.rule_group_id(rule_idx, kind);
        let tags = owner.peer_tags(&self.config.cluster, peers, rule_idx, kind);
        Ok(Some(self.group(id, expression.into_expression(), tags)))
    }

    /// Builds the group holding the pod addresses behind a named port.
    fn ip_set_group(&self, owner: &Owner, rule_id: &str, rule_idx: usize, ips: &[String]) -> Group {
        let mut expression = GroupExpression::default();
        expression.push_ip_addresses(ips.to_vec());
        self.group(
            tags::ip_set_group_id(rule_id),
            expression.into_expression(),
            owner.ip_set_tags(&self.config.cluster, rule_idx),
        )
    }
}

pub fn parse_direction(direction: &str) -> Result<Direction, Error> {
    match direction.to_ascii_lowercase().as_str() {
        "in" | "ingress" => Ok(Direction::In),
        "out" | "egress" => Ok(Direction::Out),
        _ => Err(Error::InvalidDirection(direction.to_string())),
    }
}

pub fn parse_action(action: &str) -> Result<Action, Error> {
    match action.to_ascii_lowercase().as_str() {
        "allow" => Ok(Action::Allow),
        "drop" => Ok(Action::Drop),
        "reject" => Ok(Action::Reject),
        _ => Err(Error::InvalidAction(action.to_string())),
    }
}

fn service_entry(port: &k8s::SecurityPolicyPort, resolved: &PortAddress) -> ServiceEntry {
    let destination_ports = match (resolved.port, port.end_port) {
        (None, _) => Vec::new(),
        (Some(start), Some(end)) if !port.is_named() => vec![format!("{start}-{end}")],
        (Some(start), _) => vec![start.to_string()],
    };
    ServiceEntry::l4_port_set(port.protocol.to_ascii_uppercase(), destination_ports)
}

fn namespace_condition(member_type: MemberType, namespace: &str) -> Expression {
    expr::condition(
        member_type,
        format!("{}|{namespace}", tags::SCOPE_NAMESPACE),
        None,
    )
}

fn cluster_condition(member_type: MemberType, cluster: &str) -> Expression {
    expr::condition(member_type, format!("{}|{cluster}", tags::SCOPE_CLUSTER), None)
}

fn selector_parts(
    selector: &k8s::LabelSelector,
) -> (BTreeMap<String, String>, Vec<k8s::LabelSelectorRequirement>) {
    let labels = selector.match_labels.clone().unwrap_or_default();
    let exprs = expr::merge_selector_match_expression(
        selector.match_expressions.as_deref().unwrap_or_default(),
    );
    (labels, exprs)
}

/// Builds the criteria `base AND <selector conditions>`, one per `In` value.
fn selector_criterion(
    base: Expression,
    selector: &k8s::LabelSelector,
    member_type: MemberType,
) -> Result<(Vec<Vec<Expression>>, Counts), SelectorError> {
    let (labels, exprs) = selector_parts(selector);
    let op_in = expr::validate_selector_op_in(&exprs, &labels)?;
    let counts = expr::validate_selector_expressions(labels.len(), exprs.len(), op_in, false)?;
    let mut conditions = Vec::new();
    expr::update_expressions_match_expression(&exprs, &labels, member_type, &mut conditions)?;
    let op_in_axes = [expr::op_in_conditions(&exprs, member_type)];
    let criteria = expr::expand_criteria(base, &op_in_axes, &conditions);
    Ok((criteria, at_least_one(counts)))
}

/// Builds the criteria matching pods selected by `pods` in namespaces
/// selected by `namespaces`, one per combination of their `In` values.
fn mixed_criterion(
    base: Expression,
    namespaces: &k8s::LabelSelector,
    pods: &k8s::LabelSelector,
) -> Result<(Vec<Vec<Expression>>, Counts), SelectorError> {
    let (ns_labels, ns_exprs) = selector_parts(namespaces);
    let (labels, exprs) = selector_parts(pods);
    expr::validate_ns_selector_op_not_in(&ns_exprs)?;
    let ns_in = expr::validate_selector_op_in(&ns_exprs, &ns_labels)?;
    let pod_in = expr::validate_selector_op_in(&exprs, &labels)?;
    let op_in = match (ns_in, pod_in) {
        (0, n) | (n, 0) => n,
        (a, b) => a * b,
    };
    let counts = expr::validate_selector_expressions(
        labels.len() + ns_labels.len(),
        exprs.len() + ns_exprs.len(),
        op_in,
        true,
    )?;
    let mut conditions = Vec::new();
    expr::update_mixed_expressions_match_expression(
        &ns_exprs,
        &ns_labels,
        &exprs,
        &labels,
        MemberType::Segment,
        MemberType::SegmentPort,
        &mut conditions,
    )?;
    let op_in_axes = [
        expr::op_in_conditions(&exprs, MemberType::SegmentPort),
        expr::op_in_conditions(&ns_exprs, MemberType::Segment),
    ];
    let criteria = expr::expand_criteria(base, &op_in_axes, &conditions);
    Ok((criteria, at_least_one(counts)))
}

// The base condition always makes a criterion, even for an empty selector.
fn at_least_one(counts: Counts) -> Counts {
    Counts {
        criteria: counts.criteria.max(1),
        expressions: counts.expressions,
    }
}

/// Accepts an address or a CIDR block.
fn validate_ip_block(cidr: &str) -> Result<String, SelectorError> {
    let valid =
        cidr.parse::<ipnet::IpNet>().is_ok() || cidr.parse::<IpAddr>().is_ok();
    if !valid {
        return Err(SelectorError::InvalidIpBlock(cidr.to_string()));
    }
    Ok(cidr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Conjunction, Expression, NestedExpression},
        tests::{mk_pod, mk_policy, pod_selector, test_config, FakeCluster},
    };
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU16;

    fn port(number: u16) -> k8s::SecurityPolicyPort {
        k8s::SecurityPolicyPort {
            protocol: "tcp".to_string(),
            port: Some(k8s::Port::Number(NonZeroU16::new(number).unwrap())),
            end_port: None,
        }
    }

    fn named(name: &str) -> k8s::SecurityPolicyPort {
        k8s::SecurityPolicyPort {
            protocol: "TCP".to_string(),
            port: Some(k8s::Port::Name(name.to_string())),
            end_port: None,
        }
    }

    fn rule(direction: &str, ports: Vec<k8s::SecurityPolicyPort>) -> k8s::Rule {
        k8s::Rule {
            action: "Allow".to_string(),
            direction: direction.to_string(),
            ports,
            ..Default::default()
        }
    }

    async fn compile(cluster: &FakeCluster, policy: &k8s::SecurityPolicy) -> Result<Compiled, Error> {
        let config = test_config();
        Compiler::new(&config, cluster, cluster)
            .build_security_policy(policy)
            .await
    }

    #[tokio::test]
    async fn zero_ports_yield_one_rule() {
        let mut policy = mk_policy("ns-0", "sp", "uid", vec![pod_selector(&[("app", "web")])]);
        policy.spec.rules = vec![rule("ingress", vec![])];

        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        assert_eq!(compiled.rules.len(), 1);
        let r = &compiled.rules[0];
        assert_eq!(r.id, "sp_uid_0");
        assert_eq!(r.display_name, "sp-0");
        assert_eq!(r.direction, Direction::In);
        assert_eq!(r.action, Action::Allow);
        assert_eq!(r.services, vec![ANY.to_string()]);
        assert!(r.service_entries.is_empty());
        assert_eq!(r.scope, vec![ANY.to_string()]);
        assert_eq!(r.source_groups, vec![ANY.to_string()]);
        assert_eq!(r.destination_groups, vec![ANY.to_string()]);

        assert_eq!(
            compiled.policy.scope,
            vec!["/infra/domains/default/groups/sp_uid_scope".to_string()]
        );
        assert_eq!(compiled.policy.id, "sp_uid");
        assert_eq!(compiled.groups.len(), 1);
        assert_eq!(compiled.groups[0].id, "sp_uid_scope");
    }

    #[tokio::test]
    async fn numeric_ports_share_one_rule() {
        let mut policy = mk_policy("ns-0", "sp", "uid", vec![]);
        let mut ranged = port(8000);
        ranged.end_port = NonZeroU16::new(8080);
        policy.spec.rules = vec![rule("Out", vec![port(80), port(443), ranged])];

        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        assert_eq!(compiled.rules.len(), 1);
        let entries = &compiled.rules[0].service_entries;
        assert_eq!(
            entries
                .iter()
                .map(|e| e.destination_ports.clone())
                .collect::<Vec<_>>(),
            vec![
                vec!["80".to_string()],
                vec!["443".to_string()],
                vec!["8000-8080".to_string()],
            ]
        );
        assert!(entries.iter().all(|e| e.l4_protocol == "TCP"));
        assert_eq!(compiled.policy.scope, vec![ANY.to_string()]);
        assert!(compiled.groups.is_empty());
    }

    #[tokio::test]
    async fn named_ports_expand_into_rules() {
        let mut cluster = FakeCluster::default();
        cluster.pods.push(mk_pod("ns-0", "a", &[("app", "web")], "Running", "10.0.0.1", &[("http", 8080)]));
        cluster.pods.push(mk_pod("ns-0", "b", &[("app", "web")], "Running", "10.0.0.2", &[("http", 9090)]));

        let mut policy = mk_policy("ns-0", "sp", "uid", vec![pod_selector(&[("app", "web")])]);
        policy.spec.rules = vec![rule("In", vec![port(22), named("http")])];

        let compiled = compile(&cluster, &policy).await.unwrap();
        let ids = compiled.rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["sp_uid_0", "sp_uid_0_1_0", "sp_uid_0_1_1"]);
        assert_eq!(
            compiled.rules[1].service_entries[0].destination_ports,
            vec!["8080".to_string()]
        );
        assert_eq!(
            compiled.rules[1].destination_groups,
            vec!["/infra/domains/default/groups/sp_uid_0_1_0_ipset".to_string()]
        );
        let ip_set = compiled
            .groups
            .iter()
            .find(|g| g.id == "sp_uid_0_1_1_ipset")
            .expect("ip set group must exist");
        assert_eq!(
            ip_set.expression,
            vec![Expression::IpAddressExpression(crate::model::IpAddressExpression {
                ip_addresses: vec!["10.0.0.2".to_string()],
            })]
        );

        // Only named ports: no base rule.
        policy.spec.rules = vec![rule("In", vec![named("http")])];
        let compiled = compile(&cluster, &policy).await.unwrap();
        let ids = compiled.rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["sp_uid_0_0_0", "sp_uid_0_0_1"]);
    }

    #[tokio::test]
    async fn compilation_is_deterministic() {
        let mut cluster = FakeCluster::default();
        let labels = [("app", "web"), ("tier", "fe")];
        cluster.pods.push(mk_pod("ns-0", "a", &labels, "Running", "10.0.0.1", &[("http", 8080)]));
        cluster.pods.push(mk_pod("ns-0", "b", &labels, "Running", "10.0.0.2", &[("http", 8080)]));

        let mut policy = mk_policy("ns-0", "sp", "uid", vec![pod_selector(&labels)]);
        policy.spec.rules = vec![k8s::Rule {
            sources: vec![k8s::Peer {
                ip_blocks: vec![k8s::IpBlock {
                    cidr: "192.168.0.0/24".to_string(),
                }],
                ..pod_selector_peer(&[("role", "client")])
            }],
            ..rule("In", vec![named("http")])
        }];

        let first = compile(&cluster, &policy).await.unwrap();
        cluster.pods.reverse();
        let second = compile(&cluster, &policy).await.unwrap();
        assert_eq!(first, second);
    }

    fn pod_selector_peer(labels: &[(&str, &str)]) -> k8s::Peer {
        k8s::Peer {
            pod_selector: pod_selector(labels).pod_selector,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn peer_groups() {
        let mut policy = mk_policy("ns-0", "sp", "uid", vec![]);
        policy.spec.rules = vec![k8s::Rule {
            destinations: vec![
                pod_selector_peer(&[("app", "db")]),
                k8s::Peer {
                    namespace_selector: Some(k8s::LabelSelector::default()),
                    pod_selector: pod_selector(&[("app", "cache")]).pod_selector,
                    ..Default::default()
                },
                k8s::Peer {
                    ip_blocks: vec![k8s::IpBlock {
                        cidr: "10.10.0.0/16".to_string(),
                    }],
                    ..Default::default()
                },
            ],
            ..rule("egress", vec![])
        }];

        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        let r = &compiled.rules[0];
        assert_eq!(r.direction, Direction::Out);
        assert_eq!(r.source_groups, vec![ANY.to_string()]);
        assert_eq!(
            r.destination_groups,
            vec!["/infra/domains/default/groups/sp_uid_0_dst".to_string()]
        );

        let dst = &compiled.groups[0];
        assert_eq!(dst.id, "sp_uid_0_dst");
        let or = Expression::ConjunctionOperator(crate::model::ConjunctionOperator {
            conjunction_operator: Conjunction::Or,
        });
        let and = Expression::ConjunctionOperator(crate::model::ConjunctionOperator {
            conjunction_operator: Conjunction::And,
        });
        assert_eq!(
            dst.expression,
            vec![
                Expression::NestedExpression(NestedExpression {
                    expressions: vec![
                        expr::condition(MemberType::SegmentPort, "nsx-op/namespace|ns-0".to_string(), None),
                        and.clone(),
                        expr::condition(MemberType::SegmentPort, "app|db".to_string(), None),
                    ],
                }),
                or.clone(),
                Expression::NestedExpression(NestedExpression {
                    expressions: vec![
                        expr::condition(MemberType::Segment, "nsx-op/cluster|test".to_string(), None),
                        and,
                        expr::condition(MemberType::SegmentPort, "app|cache".to_string(), None),
                    ],
                }),
                or,
                Expression::IpAddressExpression(crate::model::IpAddressExpression {
                    ip_addresses: vec!["10.10.0.0/16".to_string()],
                }),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected() {
        let mut policy = mk_policy("ns-0", "sp", "uid", vec![]);
        policy.spec.rules = vec![rule("sideways", vec![])];
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDirection(_)));

        policy.spec.rules = vec![k8s::Rule {
            action: "permit".to_string(),
            ..rule("in", vec![])
        }];
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAction(_)));

        policy.spec.rules = vec![k8s::Rule {
            sources: vec![k8s::Peer {
                ip_blocks: vec![k8s::IpBlock {
                    cidr: "10.0.0.0/33".to_string(),
                }],
                ..Default::default()
            }],
            ..rule("in", vec![])
        }];
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::Selector(SelectorError::InvalidIpBlock(_))));

        policy.spec.rules = vec![];
        policy.spec.applied_to = vec![k8s::Target {
            vm_selector: Some(k8s::LabelSelector::default()),
            pod_selector: Some(k8s::LabelSelector::default()),
        }];
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::Selector(SelectorError::PodAndVmSelector)));
    }

    #[tokio::test]
    async fn op_in_values_become_criteria() {
        let env_in = |values: &[&str]| k8s::Target {
            pod_selector: Some(k8s::LabelSelector {
                match_expressions: Some(vec![k8s::LabelSelectorRequirement {
                    key: "env".to_string(),
                    operator: "In".to_string(),
                    values: Some(values.iter().map(|v| v.to_string()).collect()),
                }]),
                ..Default::default()
            }),
            vm_selector: None,
        };
        let nested = |group: &Group| {
            group
                .expression
                .iter()
                .filter_map(|e| match e {
                    Expression::NestedExpression(n) => Some(n.expressions.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        let and = Expression::ConjunctionOperator(crate::model::ConjunctionOperator {
            conjunction_operator: Conjunction::And,
        });

        let policy = mk_policy("ns-0", "sp", "uid", vec![env_in(&["a", "b", "c"])]);
        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        let criteria = nested(&compiled.groups[0]);
        assert_eq!(criteria.len(), 3);
        assert_eq!(
            criteria[2],
            vec![
                expr::condition(MemberType::SegmentPort, "nsx-op/namespace|ns-0".to_string(), None),
                and,
                expr::condition(MemberType::SegmentPort, "env|c".to_string(), None),
            ]
        );

        // Two values and three plain selectors fill the group exactly.
        let mut targets = vec![env_in(&["a", "b"])];
        targets.extend(["x", "y", "z"].iter().map(|app| pod_selector(&[("app", *app)])));
        let policy = mk_policy("ns-0", "sp", "uid", targets.clone());
        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        assert_eq!(nested(&compiled.groups[0]).len(), 5);

        targets[0] = env_in(&["a", "b", "c"]);
        let policy = mk_policy("ns-0", "sp", "uid", targets);
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Selector(SelectorError::TooManyCriteria { count: 6, limit: 5 })
        ));
    }

    #[tokio::test]
    async fn mixed_op_in_values_cross() {
        let in_selector = |key: &str, values: &[&str]| k8s::LabelSelector {
            match_expressions: Some(vec![k8s::LabelSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values.iter().map(|v| v.to_string()).collect()),
            }]),
            ..Default::default()
        };
        let mut policy = mk_policy("ns-0", "sp", "uid", vec![]);
        policy.spec.rules = vec![k8s::Rule {
            sources: vec![k8s::Peer {
                namespace_selector: Some(in_selector("team", &["a", "b"])),
                pod_selector: Some(in_selector("app", &["x", "y"])),
                ..Default::default()
            }],
            ..rule("in", vec![])
        }];
        let compiled = compile(&FakeCluster::default(), &policy).await.unwrap();
        let src = &compiled.groups[0];
        let criteria = src
            .expression
            .iter()
            .filter(|e| matches!(e, Expression::NestedExpression(_)))
            .count();
        assert_eq!(criteria, 4);
        assert_eq!(
            src.expression[0],
            Expression::NestedExpression(NestedExpression {
                expressions: vec![
                    expr::condition(MemberType::Segment, "nsx-op/cluster|test".to_string(), None),
                    Expression::ConjunctionOperator(crate::model::ConjunctionOperator {
                        conjunction_operator: Conjunction::And,
                    }),
                    expr::condition(MemberType::SegmentPort, "app|x".to_string(), None),
                    Expression::ConjunctionOperator(crate::model::ConjunctionOperator {
                        conjunction_operator: Conjunction::And,
                    }),
                    expr::condition(MemberType::Segment, "team|a".to_string(), None),
                ],
            })
        );
    }

    #[tokio::test]
    async fn group_criteria_limit() {
        let targets = (0..6)
            .map(|i| pod_selector(&[("app", &*format!("web-{i}"))]))
            .collect::<Vec<_>>();
        let policy = mk_policy("ns-0", "sp", "uid", targets);
        let err = compile(&FakeCluster::default(), &policy).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Selector(SelectorError::TooManyCriteria { count: 6, limit: 5 })
        ));
    }
}
