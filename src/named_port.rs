use crate::{
    error::{Error, NamedPortError},
    k8s,
    model::Direction,
    pod::{NamespaceLister, PodLister, PodPorts},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU16,
};

/// A concrete destination port and the pod addresses exposing it.
///
/// `ips` is empty for numeric ports, which apply to every member of the
/// rule's groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortAddress {
    pub port: Option<NonZeroU16>,
    pub ips: Vec<String>,
}

/// Resolves one rule port to concrete (port, address set) pairs.
///
/// Numeric ports resolve to themselves. Named ports are looked up on the pods
/// the rule's traffic is destined to: for ingress rules the pods the rule (or
/// policy) applies to, and for egress rules the rule's destinations.
pub async fn resolve(
    pods: &dyn PodLister,
    namespaces: &dyn NamespaceLister,
    policy: &k8s::SecurityPolicy,
    rule: &k8s::Rule,
    direction: Direction,
    port: &k8s::SecurityPolicyPort,
) -> Result<Vec<PortAddress>, Error> {
    let name = match port.port {
        Some(k8s::Port::Name(ref name)) => name,
        Some(k8s::Port::Number(number)) => {
            return Ok(vec![PortAddress {
                port: Some(number),
                ips: Vec::new(),
            }])
        }
        None => {
            return Ok(vec![PortAddress {
                port: None,
                ips: Vec::new(),
            }])
        }
    };

    let queries = pod_queries(namespaces, policy, rule, direction).await?;
    let listed = futures::future::try_join_all(
        queries
            .iter()
            .map(|(ns, selector)| pods.list_pods(ns, selector)),
    )
    .await
    .map_err(Error::Listing)?;

    let mut by_port = BTreeMap::<NonZeroU16, BTreeSet<String>>::new();
    for pod in listed.iter().flatten() {
        let pod = PodPorts::from_pod(pod);
        for container_port in pod.named_ports(name, &port.protocol) {
            if !pod.is_running() {
                return Err(NamedPortError::PodNotRunning {
                    namespace: pod.namespace.to_string(),
                    name: pod.name.to_string(),
                }
                .into());
            }
            let ip = pod.ip.ok_or_else(|| NamedPortError::PodIpNotFound {
                namespace: pod.namespace.to_string(),
                name: pod.name.to_string(),
            })?;
            let number = match u16::try_from(container_port.container_port)
                .ok()
                .and_then(NonZeroU16::new)
            {
                Some(n) => n,
                None => {
                    tracing::warn!(
                        pod = %pod.name,
                        port = container_port.container_port,
                        "ignoring invalid container port"
                    );
                    continue;
                }
            };
            by_port.entry(number).or_default().insert(ip.to_string());
        }
    }

    if by_port.is_empty() {
        tracing::info!(port = %name, protocol = %port.protocol, "no pod exposes the named port");
        return Err(NamedPortError::NoMatchingPod {
            port: name.clone(),
            protocol: port.protocol.clone(),
        }
        .into());
    }

    Ok(merge_by_port(by_port))
}

fn merge_by_port(by_port: BTreeMap<NonZeroU16, BTreeSet<String>>) -> Vec<PortAddress> {
    by_port
        .into_iter()
        .map(|(port, ips)| PortAddress {
            port: Some(port),
            ips: ips.into_iter().collect(),
        })
        .collect()
}

/// Computes the (namespace, pod selector) pairs whose pods may expose the
/// named port.
async fn pod_queries(
    namespaces: &dyn NamespaceLister,
    policy: &k8s::SecurityPolicy,
    rule: &k8s::Rule,
    direction: Direction,
) -> Result<Vec<(String, k8s::LabelSelector)>, Error> {
    use k8s::ResourceExt;

    let policy_ns = policy.namespace().unwrap_or_default();
    let mut queries = Vec::new();
    match direction {
        Direction::In => {
            let targets = if rule.applied_to.is_empty() {
                &policy.spec.applied_to
            } else {
                &rule.applied_to
            };
            for target in targets {
                if let Some(selector) = target.pod_selector.as_ref() {
                    queries.push((policy_ns.clone(), selector.clone()));
                }
            }
        }
        Direction::Out => {
            for peer in &rule.destinations {
                if peer.vm_selector.is_some() {
                    continue;
                }
                match (peer.namespace_selector.as_ref(), peer.pod_selector.as_ref()) {
                    (Some(ns_selector), pod_selector) => {
                        let selector = pod_selector.cloned().unwrap_or_default();
                        let names = namespaces
                            .list_namespaces(ns_selector)
                            .await
                            .map_err(Error::Listing)?;
                        queries.extend(names.into_iter().map(|ns| (ns, selector.clone())));
                    }
                    (None, Some(selector)) => {
                        queries.push((policy_ns.clone(), selector.clone()));
                    }
                    (None, None) => {}
                }
            }
        }
    }
    Ok(queries)
}
