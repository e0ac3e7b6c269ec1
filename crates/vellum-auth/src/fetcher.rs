// ABOUTME: TokenFetcher collaborator that performs the network round trip for a token.
// ABOUTME: The gRPC implementation retries transient failures with jittered backoff.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::{debug, info};
use vellum_grpc::{retry_with_backoff, Error, Result, RetryPolicy};
use vellum_proto::client::AuthServiceClient;
use vellum_proto::GetAuthTokenRequest;

use crate::credentials::ClientCredentials;

/// A freshly issued token and how long it stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedToken {
    pub token: String,
    pub ttl: Duration,
}

impl FetchedToken {
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            ttl,
        }
    }
}

/// Obtains new access tokens.
///
/// Implementations classify their failures through [`vellum_grpc::ErrorKind`]
/// and are expected to have exhausted their own retries before returning one.
#[async_trait]
pub trait TokenFetcher: Send + Sync + 'static {
    /// Fetch a new token.
    async fn fetch(&self) -> Result<FetchedToken>;

    /// Release the underlying transport. Must tolerate repeated calls.
    async fn close(&self) {}
}

/// Fetches tokens from the `AuthService` over gRPC.
pub struct GrpcTokenFetcher {
    client: Mutex<Option<AuthServiceClient<Channel>>>,
    credentials: ClientCredentials,
    policy: RetryPolicy,
}

impl GrpcTokenFetcher {
    /// Create a fetcher on an existing channel.
    pub fn new(channel: Channel, credentials: ClientCredentials, policy: RetryPolicy) -> Self {
        Self {
            client: Mutex::new(Some(AuthServiceClient::new(channel))),
            credentials,
            policy,
        }
    }

    /// Connect to an auth endpoint and create a fetcher for it.
    pub async fn connect(
        address: &str,
        credentials: ClientCredentials,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let channel = vellum_grpc::create_simple_channel(address).await?;
        info!(address = address, "Auth channel connected");
        Ok(Self::new(channel, credentials, policy))
    }

    fn client(&self) -> Result<AuthServiceClient<Channel>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::failed_precondition("token fetcher is closed"))
    }
}

#[async_trait]
impl TokenFetcher for GrpcTokenFetcher {
    async fn fetch(&self) -> Result<FetchedToken> {
        let client = self.client()?;

        let response = retry_with_backoff(&self.policy, || {
            let mut client = client.clone();
            let request = GetAuthTokenRequest {
                client_id: self.credentials.client_id().to_string(),
                client_secret: self.credentials.client_secret().to_string(),
            };
            async move {
                let response = client.get_auth_token(request).await?;
                Ok::<_, Error>(response.into_inner())
            }
        })
        .await?;

        if response.auth_token.is_empty() {
            return Err(Error::protocol("auth service returned an empty token"));
        }

        debug!(
            client_id = %self.credentials.client_id(),
            expires_in_s = response.expires_in_s,
            "Fetched access token"
        );

        Ok(FetchedToken::new(
            response.auth_token,
            Duration::from_secs(response.expires_in_s),
        ))
    }

    async fn close(&self) {
        if self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Token fetcher closed");
        }
    }
}
