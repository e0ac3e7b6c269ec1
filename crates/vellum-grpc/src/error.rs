// ABOUTME: Domain error taxonomy shared by every vellum crate.
// ABOUTME: Translates tonic statuses and transport failures into classified errors.

use std::fmt;
use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tonic::Code;
use vellum_proto::ErrorDetails;

/// Result alias used throughout the vellum crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Shared, clonable error cause.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Classification of every error the client can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input.
    InvalidArgument,
    /// Missing or rejected credentials.
    Unauthenticated,
    /// Credentials lack access to the resource.
    PermissionDenied,
    /// The requested store or item does not exist.
    NotFound,
    /// The operation is not valid in the current state.
    FailedPrecondition,
    /// A put precondition (e.g. must-not-exist) was not satisfied.
    ConditionalCheckFailed,
    /// A transaction conflicted with another writer.
    ConcurrentModification,
    /// The store is busy with another operation.
    StoreInUse,
    /// The store's provisioned throughput was exceeded.
    StoreThroughputExceeded,
    /// Too many requests against the store.
    StoreRequestLimitExceeded,
    /// The service or stream is unavailable.
    Unavailable,
    /// A quota or rate limit was hit.
    ResourceExhausted,
    /// The call ran past its deadline.
    DeadlineExceeded,
    /// The server does not implement the call.
    Unimplemented,
    /// The operation was cancelled locally or remotely.
    Cancelled,
    /// Protocol corruption or an internal server fault.
    Internal,
    /// Anything not classified above.
    Unknown,
}

/// How a caller may retry a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retrying cannot succeed without changing the request.
    Never,
    /// Re-run the whole operation immediately (transaction conflicts).
    Immediate,
    /// Retry after an exponential backoff.
    Backoff,
}

impl ErrorKind {
    /// Stable name, also used as the server-side error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::FailedPrecondition => "FailedPrecondition",
            ErrorKind::ConditionalCheckFailed => "ConditionalCheckFailed",
            ErrorKind::ConcurrentModification => "ConcurrentModification",
            ErrorKind::StoreInUse => "StoreInUse",
            ErrorKind::StoreThroughputExceeded => "StoreThroughputExceeded",
            ErrorKind::StoreRequestLimitExceeded => "StoreRequestLimitExceeded",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Parse a domain-specific code sent in [`ErrorDetails`].
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code {
            "InvalidArgument" => ErrorKind::InvalidArgument,
            "Unauthenticated" => ErrorKind::Unauthenticated,
            "PermissionDenied" => ErrorKind::PermissionDenied,
            "NotFound" | "StoreNotFound" => ErrorKind::NotFound,
            "FailedPrecondition" => ErrorKind::FailedPrecondition,
            "ConditionalCheckFailed" => ErrorKind::ConditionalCheckFailed,
            "ConcurrentModification" => ErrorKind::ConcurrentModification,
            "StoreInUse" => ErrorKind::StoreInUse,
            "StoreThroughputExceeded" => ErrorKind::StoreThroughputExceeded,
            "StoreRequestLimitExceeded" => ErrorKind::StoreRequestLimitExceeded,
            _ => return None,
        };
        Some(kind)
    }

    /// Retry classification consulted by the token fetcher and callers.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ErrorKind::ConcurrentModification => RetryClass::Immediate,
            ErrorKind::Unavailable
            | ErrorKind::ResourceExhausted
            | ErrorKind::DeadlineExceeded
            | ErrorKind::StoreInUse
            | ErrorKind::StoreThroughputExceeded
            | ErrorKind::StoreRequestLimitExceeded => RetryClass::Backoff,
            _ => RetryClass::Never,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Code> for ErrorKind {
    fn from(code: Code) -> Self {
        match code {
            Code::InvalidArgument | Code::OutOfRange => ErrorKind::InvalidArgument,
            Code::Unauthenticated => ErrorKind::Unauthenticated,
            Code::PermissionDenied => ErrorKind::PermissionDenied,
            Code::NotFound => ErrorKind::NotFound,
            Code::FailedPrecondition => ErrorKind::FailedPrecondition,
            Code::Aborted => ErrorKind::ConcurrentModification,
            Code::Unavailable => ErrorKind::Unavailable,
            Code::ResourceExhausted => ErrorKind::ResourceExhausted,
            Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Code::Unimplemented => ErrorKind::Unimplemented,
            Code::Cancelled => ErrorKind::Cancelled,
            Code::Internal | Code::DataLoss => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Error surfaced by every vellum operation.
///
/// Cloning is cheap; the cause chain is shared so one failure can be handed to
/// every caller waiting on the same operation.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<ErrorSource>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an upstream cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// The stream was closed before the expected response arrived.
    pub fn stream_closed() -> Self {
        Self::new(ErrorKind::Unavailable, "stream closed unexpectedly")
    }

    /// The peer violated the message protocol.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Invalid caller input.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Operation attempted in the wrong state.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying (immediately or after backoff) may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind.retry_class() != RetryClass::Never
    }

    pub fn retry_class(&self) -> RetryClass {
        self.kind.retry_class()
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let mut kind = ErrorKind::from(status.code());
        let mut message = status.message().to_string();

        // Domain-specific details take precedence over the bare gRPC code.
        if !status.details().is_empty() {
            match ErrorDetails::decode(status.details()) {
                Ok(details) => {
                    if let Some(detailed) = ErrorKind::from_code(&details.code) {
                        kind = detailed;
                    }
                    if !details.message.is_empty() {
                        message = details.message;
                    }
                    if !details.upstream_cause.is_empty() {
                        message = format!("{message} (upstream: {})", details.upstream_cause);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring undecodable status details");
                }
            }
        }

        Self {
            kind,
            message,
            source: Some(Arc::new(status)),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::new(ErrorKind::Unavailable, format!("connection failed: {err}")).with_source(err)
    }
}
