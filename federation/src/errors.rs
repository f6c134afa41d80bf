use hyper::StatusCode;
use hyper::body::Bytes;
use hyper::Response;
use thiserror::Error;

/// Result type alias for federation operations
pub type Result<T, E = FederationError> = std::result::Result<T, E>;

/// Errors that can occur while dispatching a federated request
#[derive(Error, Debug)]
pub enum FederationError {
    #[error("{0}")]
    BadRequest(String),

    #[error("no proxy available for cluster {0}")]
    UnknownRemote(String),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Invalid manifest stream: {0}")]
    InvalidStream(String),

    #[error("{0}")]
    PdhMismatch(String),

    #[error("Response serialization error: {0}")]
    ResponseSerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FederationError {
    /// HTTP status the gateway reports for this failure when it reaches the
    /// client directly (fan-out paths aggregate their own statuses).
    pub fn status(&self) -> StatusCode {
        match self {
            FederationError::BadRequest(_) | FederationError::RequestBodyError(_) => {
                StatusCode::BAD_REQUEST
            }
            FederationError::UnknownRemote(_) => StatusCode::NOT_FOUND,
            FederationError::UpstreamRequestFailed(..) | FederationError::ResponseBodyError(_) => {
                StatusCode::BAD_GATEWAY
            }
            FederationError::InvalidStream(_)
            | FederationError::PdhMismatch(_)
            | FederationError::ResponseSerializationError(_)
            | FederationError::InternalError(_)
            | FederationError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders this error as the wire error schema `{"errors": [...]}`.
    pub fn into_response(self) -> Response<Bytes> {
        shared::http::error_response(self.status(), &self.to_string())
    }
}
