//! Error taxonomy of the HTTP bridge and its mapping to HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gittp_git::GitError;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while serving a smart HTTP request.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The request URI names no git service.
    #[error("no matching service: {0}")]
    NoMatchingService(String),

    /// The request path does not address a repository endpoint.
    #[error("not a git request: {0}")]
    NotAGitRequest(String),

    /// The HTTP body could not be read.
    #[error("could not read request body: {0}")]
    RequestBodyReadFailure(String),

    /// The receive-pack command line is corrupt.
    #[error("malformed receive-pack negotiation: {0}")]
    MalformedNegotiation(String),

    /// A fetch addressed a repository that does not exist.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The pre-create policy declined to create a missing repository.
    #[error("repository creation denied: {0}")]
    RepositoryCreationDenied(String),

    /// Creating a bare repository failed.
    #[error("could not initialize repository {path}: {reason}")]
    RepositoryInitFailure {
        /// Repository location.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// The pre-receive policy declined the push.
    #[error("push rejected: {0}")]
    HookRejected(String),

    /// A hook policy panicked.
    #[error("hook failed: {0}")]
    HookFailed(String),

    /// The external git process failed.
    #[error("{service} failed: {reason}")]
    CommandExecutionFailure {
        /// Service or git subcommand that was run.
        service: String,
        /// What went wrong.
        reason: String,
    },

    /// I/O error writing the response.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeError {
    /// HTTP status reported for this error when no response bytes were sent yet.
    ///
    /// Command failures map to 500 rather than the 304 older gittp releases sent.
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::RepositoryNotFound(_) | ServeError::RepositoryCreationDenied(_) => {
                StatusCode::NOT_FOUND
            }
            ServeError::HookRejected(_) => StatusCode::FORBIDDEN,
            ServeError::NoMatchingService(_)
            | ServeError::NotAGitRequest(_)
            | ServeError::RequestBodyReadFailure(_)
            | ServeError::MalformedNegotiation(_)
            | ServeError::RepositoryInitFailure { .. }
            | ServeError::HookFailed(_)
            | ServeError::CommandExecutionFailure { .. }
            | ServeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GitError> for ServeError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::NoMatchingService(uri) => ServeError::NoMatchingService(uri),
            GitError::NotAGitRequest(uri) => ServeError::NotAGitRequest(uri),
            GitError::Io(e) => ServeError::Io(e),
            e @ GitError::PayloadTooLarge(_) => {
                ServeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
            // Framing errors only arise while reading the push body.
            e @ (GitError::InvalidPktLine(_)
            | GitError::TruncatedPacket { .. }
            | GitError::MalformedNegotiation(_)) => ServeError::MalformedNegotiation(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}
