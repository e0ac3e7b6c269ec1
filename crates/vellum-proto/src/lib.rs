// ABOUTME: Re-exports generated protobuf types for the vellum protocol.
// ABOUTME: Single source of truth for vellum gRPC services and message types.

#![allow(clippy::derive_partial_eq_without_eq)]

/// Generated protobuf types for the vellum protocol.
pub mod vellum {
    tonic::include_proto!("vellum");
}

// Re-export commonly used types at crate root for convenience
pub use vellum::*;

// Re-export client types under a client module
pub mod client {
    pub use super::vellum::auth_service_client::AuthServiceClient;
    pub use super::vellum::database_service_client::DatabaseServiceClient;
}

// Re-export server types under a server module
pub mod server {
    pub use super::vellum::auth_service_server::{AuthService, AuthServiceServer};
    pub use super::vellum::database_service_server::{DatabaseService, DatabaseServiceServer};
}
