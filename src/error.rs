use crate::client::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid rule direction {0:?}, must be one of In, Ingress, Out or Egress")]
    InvalidDirection(String),

    #[error("invalid rule action {0:?}, must be one of Allow, Drop or Reject")]
    InvalidAction(String),

    #[error("{0} must have a namespace, a name and a UID")]
    MissingMetadata(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    NamedPort(#[from] NamedPortError),

    #[error("failed to list workloads: {0}")]
    Listing(#[source] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to decode {kind} from search result: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid hierarchy path {0:?}")]
    InvalidPath(String),

    #[error("realization of {path} failed: {message}")]
    RealizeFailed { path: String, message: String },

    #[error("{path} was not realized before the backoff was exhausted")]
    NotRealized { path: String },
}

/// Selector-expression validation failures. None of these are retryable
/// without a change to the source resource.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("count of operator 'In' expressions {0} exceeds the limit of 1")]
    TooManyInOperators(usize),

    #[error("duplicated key {0:?} in matchLabels and operator 'In' matchExpressions")]
    DuplicatedInKey(String),

    #[error("count of values {count} in operator 'In' expression exceeds the limit of {limit}")]
    TooManyInValues { count: usize, limit: usize },

    #[error("operator 'In' expression for key {0:?} has no values")]
    EmptyInValues(String),

    #[error("total count of selector expressions {count} exceeds the limit of {limit} in one criterion")]
    TooManyExpressions { count: usize, limit: usize },

    #[error("total count of criteria {count} exceeds the limit of {limit} in one group")]
    TooManyCriteria { count: usize, limit: usize },

    #[error("operator {0:?} is not supported")]
    UnsupportedOperator(String),

    #[error("operator 'NotIn' is not supported for namespace selectors")]
    NamespaceNotIn,

    #[error("podSelector and vmSelector may not both be set in one target")]
    PodAndVmSelector,

    #[error("vmSelector and namespaceSelector may not both be set in one peer")]
    VmAndNamespaceSelector,

    #[error("invalid IP block {0:?}")]
    InvalidIpBlock(String),

    #[error("IP block {0:?} uses except, which is not supported")]
    IpBlockExcept(String),
}

/// Failures resolving a named port to concrete pod addresses.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NamedPortError {
    #[error("pod {namespace}/{name} is not running")]
    PodNotRunning { namespace: String, name: String },

    #[error("pod {namespace}/{name} has no IP address")]
    PodIpNotFound { namespace: String, name: String },

    #[error("no running pod exposes port {port}/{protocol}")]
    NoMatchingPod { port: String, protocol: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// === impl Error ===

impl Error {
    /// A stable identifier for the kind of failure, suitable for annotating
    /// the source resource.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidDirection(_)
            | Self::InvalidAction(_)
            | Self::MissingMetadata(_)
            | Self::InvalidPort(_) => "InvalidSpec",
            Self::Selector(_) => "InvalidSelector",
            Self::NamedPort(NamedPortError::PodNotRunning { .. }) => "PodNotRunning",
            Self::NamedPort(NamedPortError::PodIpNotFound { .. }) => "PodIPNotFound",
            Self::NamedPort(NamedPortError::NoMatchingPod { .. }) => "NoMatchingPod",
            Self::Listing(_) => "ListFailed",
            Self::Api(ApiError::InvalidLicense { .. }) => "RestrictionError",
            Self::Api(_) => "NSXOperationFailed",
            Self::Decode { .. } => "DecodeFailed",
            Self::InvalidPath(_) => "InvalidPath",
            Self::RealizeFailed { .. } => "RealizeFailed",
            Self::NotRealized { .. } => "NotRealized",
        }
    }

    /// Returns true if retrying the same operation may succeed without the
    /// source resource changing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidDirection(_)
            | Self::InvalidAction(_)
            | Self::MissingMetadata(_)
            | Self::InvalidPort(_)
            | Self::Selector(_)
            | Self::Decode { .. }
            | Self::InvalidPath(_)
            | Self::RealizeFailed { .. } => false,
            Self::NamedPort(e) => matches!(e, NamedPortError::NoMatchingPod { .. }),
            Self::Api(e) => e.is_retryable(),
            Self::Listing(_) | Self::NotRealized { .. } => true,
        }
    }
}
