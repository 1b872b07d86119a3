#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod security_policy;

pub use self::security_policy::{
    IpBlock, Peer, Port, Rule, SecurityPolicy, SecurityPolicyPort, SecurityPolicySpec, Target,
};
pub use k8s_openapi::{
    api::{
        core::v1::{Container, ContainerPort, Namespace, Pod, PodSpec, PodStatus},
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
        util::intstr::IntOrString,
    },
};
pub use kube::api::{ObjectMeta, ResourceExt};

/// Label-selector operators understood by Kubernetes.
pub mod selector_op {
    pub const IN: &str = "In";
    pub const NOT_IN: &str = "NotIn";
    pub const EXISTS: &str = "Exists";
    pub const DOES_NOT_EXIST: &str = "DoesNotExist";
}
