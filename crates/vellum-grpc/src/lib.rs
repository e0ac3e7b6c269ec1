// ABOUTME: Shared gRPC client utilities for the vellum database client.
// ABOUTME: Provides channel creation, bidirectional streaming, error translation, and backoff.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod stream;

// Channel creation
pub use channel::{
    create_channel, create_simple_channel, make_endpoint, ChannelConfig, KeepAliveConfig,
    DEFAULT_ENDPOINT,
};

// Error types
pub use error::{Error, ErrorKind, ErrorSource, Result, RetryClass};

// Retry
pub use backoff::{retry_with_backoff, RetryPolicy, MAX_RETRY_ATTEMPTS};

// Stream management
pub use stream::{OutboundStream, StreamReceiver, StreamSender};

// Re-export proto types for convenience
pub use vellum_proto;
