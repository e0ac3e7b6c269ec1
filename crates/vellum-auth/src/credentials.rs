// ABOUTME: Client credential material used to obtain access tokens.
// ABOUTME: Resolves client id and secret from explicit values or the environment.

use std::fmt;

use vellum_grpc::{Error, ErrorKind, Result};

/// Environment variable holding the client id.
pub const CLIENT_ID_ENV: &str = "VELLUM_CLIENT_ID";
/// Environment variable holding the client secret.
pub const CLIENT_SECRET_ENV: &str = "VELLUM_CLIENT_SECRET";

/// Client id and secret exchanged for access tokens.
///
/// The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    /// Create credentials from explicit values.
    ///
    /// # Errors
    /// Returns an `Unauthenticated` error if either value is empty.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<Self> {
        let client_id = client_id.into().trim().to_string();
        let client_secret = client_secret.into().trim().to_string();
        if client_id.is_empty() {
            return Err(missing(CLIENT_ID_ENV));
        }
        if client_secret.is_empty() {
            return Err(missing(CLIENT_SECRET_ENV));
        }
        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Load credentials from `VELLUM_CLIENT_ID` / `VELLUM_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self> {
        Self::resolve(None, None)
    }

    /// Resolve credentials, preferring explicit values over the environment.
    ///
    /// This is a fatal configuration check: missing material fails
    /// synchronously and is never retried.
    pub fn resolve(client_id: Option<String>, client_secret: Option<String>) -> Result<Self> {
        Self::resolve_with(client_id, client_secret, |name| std::env::var(name).ok())
    }

    fn resolve_with<F>(
        client_id: Option<String>,
        client_secret: Option<String>,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = client_id
            .filter(|s| !s.trim().is_empty())
            .or_else(|| lookup(CLIENT_ID_ENV).filter(|s| !s.trim().is_empty()))
            .ok_or_else(|| missing(CLIENT_ID_ENV))?;
        let client_secret = client_secret
            .filter(|s| !s.trim().is_empty())
            .or_else(|| lookup(CLIENT_SECRET_ENV).filter(|s| !s.trim().is_empty()))
            .ok_or_else(|| missing(CLIENT_SECRET_ENV))?;
        Self::new(client_id, client_secret)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

fn missing(var: &str) -> Error {
    Error::new(
        ErrorKind::Unauthenticated,
        format!("no client credentials configured: pass them explicitly or set {var}"),
    )
}
