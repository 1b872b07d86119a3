//! Converts Kubernetes `NetworkPolicy` resources into `SecurityPolicy`
//! resources.
//!
//! Each `NetworkPolicy` yields an allow policy holding its rules and an
//! isolation policy that drops all other traffic in the directions the policy
//! affects. The isolation policy has a lower priority so that allow rules from
//! every `NetworkPolicy` selecting a pod are evaluated first.

use crate::{
    error::{Error, SelectorError},
    k8s::{self, ResourceExt},
    tags,
};
use std::num::NonZeroU16;

pub const ALLOW_PRIORITY: i64 = 1000;
pub const ISOLATION_PRIORITY: i64 = 1001;

const INGRESS: &str = "Ingress";
const EGRESS: &str = "Egress";

/// Returns the allow and isolation policies for `policy`, in that order.
pub fn to_security_policies(
    policy: &k8s::NetworkPolicy,
) -> Result<[k8s::SecurityPolicy; 2], Error> {
    let meta = (policy.namespace(), policy.metadata.name.clone(), policy.uid());
    let (namespace, name, uid) = match meta {
        (Some(ns), Some(name), Some(uid)) => (ns, name, uid),
        (ns, name, _) => {
            return Err(Error::MissingMetadata(format!(
                "NetworkPolicy {}/{}",
                ns.unwrap_or_default(),
                name.unwrap_or_default()
            )))
        }
    };
    let spec = policy.spec.clone().unwrap_or_default();
    let (is_ingress, is_egress) = policy_types(&spec);
    let applied_to = vec![k8s::Target {
        pod_selector: Some(spec.pod_selector.clone()),
        vm_selector: None,
    }];

    let mut allow_rules = Vec::new();
    let mut isolation_rules = Vec::new();
    if is_ingress {
        for (idx, rule) in spec.ingress.iter().flatten().enumerate() {
            allow_rules.push(k8s::Rule {
                action: "Allow".to_string(),
                direction: INGRESS.to_string(),
                name: Some(format!("{name}-ingress-{idx}")),
                sources: peers(rule.from.iter().flatten())?,
                ports: ports(rule.ports.iter().flatten())?,
                ..Default::default()
            });
        }
        isolation_rules.push(k8s::Rule {
            action: "Drop".to_string(),
            direction: INGRESS.to_string(),
            name: Some(format!("{name}-ingress-isolation")),
            ..Default::default()
        });
    }
    if is_egress {
        for (idx, rule) in spec.egress.iter().flatten().enumerate() {
            allow_rules.push(k8s::Rule {
                action: "Allow".to_string(),
                direction: EGRESS.to_string(),
                name: Some(format!("{name}-egress-{idx}")),
                destinations: peers(rule.to.iter().flatten())?,
                ports: ports(rule.ports.iter().flatten())?,
                ..Default::default()
            });
        }
        isolation_rules.push(k8s::Rule {
            action: "Drop".to_string(),
            direction: EGRESS.to_string(),
            name: Some(format!("{name}-egress-isolation")),
            ..Default::default()
        });
    }

    let derived = |uid: String, priority: i64, rules: Vec<k8s::Rule>| {
        let mut sp = k8s::SecurityPolicy::new(
            &name,
            k8s::SecurityPolicySpec {
                applied_to: applied_to.clone(),
                rules,
                priority,
            },
        );
        sp.metadata.namespace = Some(namespace.clone());
        sp.metadata.uid = Some(uid);
        sp
    };
    tracing::debug!(
        %namespace,
        %name,
        is_ingress,
        is_egress,
        rules = allow_rules.len(),
        "converted NetworkPolicy"
    );
    Ok([
        derived(tags::allow_uid(&uid), ALLOW_PRIORITY, allow_rules),
        derived(tags::isolation_uid(&uid), ISOLATION_PRIORITY, isolation_rules),
    ])
}

/// Returns whether the policy affects ingress and egress traffic.
///
/// Without explicit policy types, every policy affects ingress and only
/// policies with an egress section affect egress.
fn policy_types(spec: &k8s::NetworkPolicySpec) -> (bool, bool) {
    match spec.policy_types {
        Some(ref types) => (
            types.iter().any(|t| t == INGRESS),
            types.iter().any(|t| t == EGRESS),
        ),
        None => (true, spec.egress.is_some()),
    }
}

fn peers<'p>(
    peers: impl IntoIterator<Item = &'p k8s::NetworkPolicyPeer>,
) -> Result<Vec<k8s::Peer>, Error> {
    peers
        .into_iter()
        .map(|peer| -> Result<_, Error> {
            let mut ip_blocks = Vec::new();
            if let Some(block) = &peer.ip_block {
                if block.except.as_ref().map_or(false, |e| !e.is_empty()) {
                    return Err(Error::Selector(SelectorError::IpBlockExcept(block.cidr.clone())));
                }
                ip_blocks.push(k8s::IpBlock {
                    cidr: block.cidr.clone(),
                });
            }
            Ok(k8s::Peer {
                pod_selector: peer.pod_selector.clone(),
                namespace_selector: peer.namespace_selector.clone(),
                vm_selector: None,
                ip_blocks,
            })
        })
        .collect()
}

fn ports<'p>(
    ports: impl IntoIterator<Item = &'p k8s::NetworkPolicyPort>,
) -> Result<Vec<k8s::SecurityPolicyPort>, Error> {
    ports
        .into_iter()
        .map(|port| -> Result<_, Error> {
            let number = match &port.port {
                None => None,
                Some(k8s::IntOrString::Int(n)) => Some(k8s::Port::Number(
                    u16::try_from(*n)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| Error::InvalidPort(n.to_string()))?,
                )),
                Some(k8s::IntOrString::String(name)) => Some(k8s::Port::Name(name.clone())),
            };
            Ok(k8s::SecurityPolicyPort {
                protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                port: number,
                end_port: None,
            })
        })
        .collect()
}
