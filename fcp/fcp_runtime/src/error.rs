use crate::path::ResolveError;
use crate::schema::UnknownCatalogError;
use crate::update::UpdateError;
use crate::validate::ValidationErrors;

/// Convenience result type used across the runtime.
pub type FcpResult<T> = Result<T, FcpError>;

/// Top-level error taxonomy for protocol handling.
#[derive(thiserror::Error, Debug)]
pub enum FcpError {
    /// Catalog, property or state shape mismatch.
    #[error("schema violation: {0}")]
    Validation(#[from] ValidationErrors),

    /// A state path could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// An update batch was rejected; the snapshot is unchanged.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Catalog negotiation miss. The client is expected to retry with a full catalog.
    #[error("unknown catalog: {}", .0.message)]
    UnknownCatalog(UnknownCatalogError),

    /// JSON parse or shape failure. The whole message is discarded.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// A message arrived that the current session phase cannot accept.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FcpError {
    /// Build a [`FcpError::Protocol`] value.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Stable wire code used when reporting this error to the peer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "schema_violation",
            Self::Resolve(err) => err.code(),
            Self::Update(_) => "update_rejected",
            Self::UnknownCatalog(_) => "unknown_catalog",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::Protocol(_) => "protocol_error",
        }
    }
}
