use crate::{error::SelectorError, expr, k8s};
use anyhow::Result;
use kube::api::{Api, ListParams};

/// Lists pods by namespace and label selector.
#[async_trait::async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &k8s::LabelSelector)
        -> Result<Vec<k8s::Pod>>;
}

/// Lists namespace names by label selector.
#[async_trait::async_trait]
pub trait NamespaceLister: Send + Sync {
    async fn list_namespaces(&self, selector: &k8s::LabelSelector) -> Result<Vec<String>>;
}

/// Holds the parts of a pod that named-port resolution inspects.
#[derive(Clone, Debug, PartialEq)]
pub struct PodPorts<'p> {
    pub namespace: &'p str,
    pub name: &'p str,
    pub phase: Option<&'p str>,
    pub ip: Option<&'p str>,
    pub ports: Vec<&'p k8s::ContainerPort>,
}

pub const RUNNING: &str = "Running";

// === impl PodPorts ===

impl<'p> PodPorts<'p> {
    pub fn from_pod(pod: &'p k8s::Pod) -> Self {
        let status = pod.status.as_ref();
        let ports = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .collect();
        Self {
            namespace: pod.metadata.namespace.as_deref().unwrap_or_default(),
            name: pod.metadata.name.as_deref().unwrap_or_default(),
            phase: status.and_then(|s| s.phase.as_deref()),
            ip: status
                .and_then(|s| s.pod_ip.as_deref())
                .filter(|ip| !ip.is_empty()),
            ports,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == Some(RUNNING)
    }

    /// Returns the container ports exposed under `name` for `protocol`.
    pub fn named_ports<'a>(
        &'a self,
        name: &'a str,
        protocol: &'a str,
    ) -> impl Iterator<Item = &'p k8s::ContainerPort> + 'a {
        self.ports.iter().copied().filter(move |p| {
            p.name.as_deref() == Some(name)
                && p.protocol.as_deref().unwrap_or("TCP").eq_ignore_ascii_case(protocol)
        })
    }
}

fn list_params(selector: &k8s::LabelSelector) -> Result<ListParams, SelectorError> {
    let query = expr::selector_to_query(selector)?;
    let params = ListParams::default();
    if query.is_empty() {
        return Ok(params);
    }
    Ok(params.labels(&query))
}

#[async_trait::async_trait]
impl PodLister for kube::Client {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &k8s::LabelSelector,
    ) -> Result<Vec<k8s::Pod>> {
        let params = list_params(selector)?;
        let pods = Api::<k8s::Pod>::namespaced(self.clone(), namespace)
            .list(&params)
            .await?;
        tracing::debug!(%namespace, pods = pods.items.len(), "listed pods");
        Ok(pods.items)
    }
}

#[async_trait::async_trait]
impl NamespaceLister for kube::Client {
    async fn list_namespaces(&self, selector: &k8s::LabelSelector) -> Result<Vec<String>> {
        let params = list_params(selector)?;
        let namespaces = Api::<k8s::Namespace>::all(self.clone())
            .list(&params)
            .await?;
        Ok(namespaces
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, number: i32, protocol: Option<&str>) -> k8s::ContainerPort {
        k8s::ContainerPort {
            name: Some(name.to_string()),
            container_port: number,
            protocol: protocol.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn named_ports_match_name_and_protocol() {
        let pod = k8s::Pod {
            metadata: k8s::ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("pod-0".to_string()),
                ..Default::default()
            },
            spec: Some(k8s::PodSpec {
                containers: vec![
                    k8s::Container {
                        name: "a".to_string(),
                        ports: Some(vec![port("http", 8080, None), port("dns", 53, Some("UDP"))]),
                        ..Default::default()
                    },
                    k8s::Container {
                        name: "b".to_string(),
                        ports: Some(vec![port("http", 9090, Some("TCP"))]),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            status: Some(k8s::PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(String::new()),
                ..Default::default()
            }),
        };

        let ports = PodPorts::from_pod(&pod);
        assert!(ports.is_running());
        assert_eq!(ports.ip, None, "empty IPs are treated as missing");
        let http = ports
            .named_ports("http", "TCP")
            .map(|p| p.container_port)
            .collect::<Vec<_>>();
        assert_eq!(http, vec![8080, 9090]);
        assert_eq!(ports.named_ports("dns", "TCP").count(), 0);
        assert_eq!(ports.named_ports("dns", "UDP").count(), 1);
    }
}
