// ABOUTME: Access-token acquisition for the vellum client.
// ABOUTME: Credentials, token fetchers, the caching provider, and request authorization.

pub mod authorizer;
pub mod credentials;
pub mod fetcher;
pub mod provider;

pub use authorizer::{apply_bearer, Authorizer, AUTHORIZATION_HEADER};
pub use credentials::{ClientCredentials, CLIENT_ID_ENV, CLIENT_SECRET_ENV};
pub use fetcher::{FetchedToken, GrpcTokenFetcher, TokenFetcher};
pub use provider::{
    ProviderConfig, TokenProvider, DEFAULT_MIN_RENEWABLE_LIFETIME, DEFAULT_RENEWAL_JITTER_MAX,
    DEFAULT_RENEWAL_JITTER_MIN,
};
