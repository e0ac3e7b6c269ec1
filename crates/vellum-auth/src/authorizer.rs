// ABOUTME: Attaches bearer tokens from a TokenProvider to outgoing gRPC requests.
// ABOUTME: Used for every unary and streaming database call.

use tonic::metadata::MetadataValue;
use tonic::Request;
use vellum_grpc::{Error, Result};

use crate::provider::TokenProvider;

/// Metadata key carrying the access token.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Insert `authorization: Bearer <token>` into a request's metadata.
pub fn apply_bearer<T>(request: &mut Request<T>, token: &str) -> Result<()> {
    let value: MetadataValue<_> = format!("Bearer {token}")
        .parse()
        .map_err(|e| Error::protocol(format!("token is not valid header material: {e}")))?;
    request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
    Ok(())
}

/// Decorates requests with the provider's current token.
#[derive(Clone)]
pub struct Authorizer {
    provider: TokenProvider,
}

impl Authorizer {
    pub fn new(provider: TokenProvider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &TokenProvider {
        &self.provider
    }

    /// Add the current token to an existing request.
    pub async fn authorize<T>(&self, request: &mut Request<T>) -> Result<()> {
        let token = self.provider.get_token(false).await?;
        apply_bearer(request, &token)
    }

    /// Wrap a message in an authorized request.
    pub async fn request<T>(&self, message: T) -> Result<Request<T>> {
        let mut request = Request::new(message);
        self.authorize(&mut request).await?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_grpc::ErrorKind;

    #[test]
    fn test_apply_bearer_sets_header() {
        let mut request = Request::new(());
        apply_bearer(&mut request, "abc123").unwrap();
        let value = request.metadata().get(AUTHORIZATION_HEADER).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer abc123");
    }

    #[test]
    fn test_apply_bearer_replaces_existing() {
        let mut request = Request::new(());
        apply_bearer(&mut request, "old").unwrap();
        apply_bearer(&mut request, "new").unwrap();
        let values: Vec<_> = request
            .metadata()
            .get_all(AUTHORIZATION_HEADER)
            .iter()
            .collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].to_str().unwrap(), "Bearer new");
    }

    #[test]
    fn test_apply_bearer_rejects_control_characters() {
        let mut request = Request::new(());
        let err = apply_bearer(&mut request, "bad\ntoken").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
