#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod client;
pub mod compile;
mod error;
pub mod expr;
pub mod hierarchy;
pub mod index;
pub mod model;
pub mod named_port;
pub mod network_policy;
pub mod pod;
pub mod realize;
pub mod search;
pub mod service;
pub mod tags;


pub use self::{
    binding::{SubnetBinding, SubnetBindingService},
    client::{ApiError, DryRunClient, PolicyClient},
    error::{Error, NamedPortError, Result, SelectorError},
    hierarchy::Hierarchy,
    service::SecurityPolicyService,
};
pub use security_policy_k8s_api as k8s;

/// Identifies this cluster and where its policy objects are created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Tagged on every generated object and used to scope searches.
    pub cluster: String,
    pub hierarchy: Hierarchy,
}
