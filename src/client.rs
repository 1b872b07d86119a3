use crate::model::{RealizedEntity, Root, SearchResponse};

/// The remote control plane operations the engine depends on.
///
/// Transport, authentication and rate limiting live behind this trait.
#[async_trait::async_trait]
pub trait PolicyClient: Send + Sync {
    /// Applies a hierarchical PATCH body atomically.
    async fn patch(&self, root: &Root, enforce_revision_check: bool) -> Result<(), ApiError>;

    /// Returns one page of search results for `query`.
    async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<SearchResponse, ApiError>;

    /// Lists the realized entities for an intent path.
    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("page size {page_size} is too large")]
    PageTooLarge { page_size: i64 },

    #[error("object was modified concurrently: {message}")]
    RevisionConflict { message: String },

    #[error("license does not permit the operation: {message}")]
    InvalidLicense { message: String },

    #[error("request rejected (error code {code}): {message}")]
    Invalid { code: i64, message: String },

    #[error("remote service error (error code {code}): {message}")]
    Service { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

// Error codes returned by the remote API that are handled specially.
const PAGE_SIZE_TOO_LARGE: i64 = 60512;
const INVALID_LICENSE: i64 = 505;
const REVISION_CONFLICT: i64 = 604;

// === impl ApiError ===

impl ApiError {
    /// Classifies an error response by its error code and HTTP status.
    pub fn from_response(status: u16, code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            PAGE_SIZE_TOO_LARGE => Self::PageTooLarge { page_size: 0 },
            INVALID_LICENSE => Self::InvalidLicense { message },
            REVISION_CONFLICT => Self::RevisionConflict { message },
            _ if status == 400 => Self::Invalid { code, message },
            _ => Self::Service { code, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PageTooLarge { .. }
            | Self::RevisionConflict { .. }
            | Self::Service { .. }
            | Self::Transport(_) => true,
            Self::InvalidLicense { .. } | Self::Invalid { .. } => false,
        }
    }
}

#[async_trait::async_trait]
impl<C: PolicyClient + ?Sized> PolicyClient for std::sync::Arc<C> {
    async fn patch(&self, root: &Root, enforce_revision_check: bool) -> Result<(), ApiError> {
        (**self).patch(root, enforce_revision_check).await
    }

    async fn search(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: i64,
    ) -> Result<SearchResponse, ApiError> {
        (**self).search(query, cursor, page_size).await
    }

    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, ApiError> {
        (**self).list_realized_entities(intent_path).await
    }
}

/// A client that writes PATCH bodies to stdout instead of sending them.
///
/// Searches return no results and every intent is reported as realized.
#[derive(Clone, Debug, Default)]
pub struct DryRunClient(());

#[async_trait::async_trait]
impl PolicyClient for DryRunClient {
    async fn patch(&self, root: &Root, enforce_revision_check: bool) -> Result<(), ApiError> {
        let body = serde_json::to_string_pretty(root)
            .map_err(|error| ApiError::Transport(error.into()))?;
        tracing::debug!(enforce_revision_check, "dry-run patch");
        println!("{body}");
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        _cursor: Option<&str>,
        _page_size: i64,
    ) -> Result<SearchResponse, ApiError> {
        tracing::debug!(%query, "dry-run search");
        Ok(SearchResponse::default())
    }

    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, ApiError> {
        tracing::trace!(%intent_path, "dry-run realization");
        Ok(vec![RealizedEntity {
            entity_type: "RealizedFirewallSection".to_string(),
            state: crate::realize::REALIZED.to_string(),
            alarms: Vec::new(),
        }])
    }
}
