// ABOUTME: Client library for the vellum document database.
// ABOUTME: Unary item calls, streamed lists and syncs, and stream-backed transactions.

pub mod client;
pub mod config;
pub mod list;
pub mod schema;
pub mod transaction;

pub use client::{Client, PutOptions};
pub use config::{config_path, ClientConfig, ENDPOINT_ENV, REGION_ENV, STORE_ID_ENV};
pub use list::{ListOptions, ListResult, ListToken, SortDirection, SyncResult};
pub use schema::{RawSchema, Schema};
pub use transaction::{
    is_conflict, CommitResult, GeneratedId, Transaction, TransactionPhase, TransactionResult,
    TERMINAL_MESSAGE_ID,
};

pub use vellum_auth::{ClientCredentials, ProviderConfig, TokenFetcher, TokenProvider};
pub use vellum_grpc::{Error, ErrorKind, Result, RetryClass, RetryPolicy};
pub use vellum_proto as proto;
