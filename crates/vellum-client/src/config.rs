// ABOUTME: Client configuration with builder methods and file/env loading.
// ABOUTME: Precedence is env > .env > ~/.config/vellum/config.toml > defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vellum_auth::{ClientCredentials, ProviderConfig, CLIENT_ID_ENV, CLIENT_SECRET_ENV};
use vellum_grpc::{make_endpoint, Error, Result, RetryPolicy};

pub const ENDPOINT_ENV: &str = "VELLUM_ENDPOINT";
pub const REGION_ENV: &str = "VELLUM_REGION";
pub const STORE_ID_ENV: &str = "VELLUM_STORE_ID";

/// Raw TOML structure for ~/.config/vellum/config.toml
#[derive(Deserialize, Default, Debug)]
struct ConfigToml {
    store_id: Option<u64>,
    endpoint: Option<String>,
    region: Option<String>,
    auth_endpoint: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    allow_stale: Option<bool>,
}

/// Everything needed to connect a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub store_id: u64,
    /// Explicit database endpoint. Wins over `region`.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Auth service endpoint. Defaults to the database endpoint.
    pub auth_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub provider: ProviderConfig,
    /// Retry policy for token fetches.
    pub retry: RetryPolicy,
    /// Default for reads that do not say otherwise.
    pub allow_stale: bool,
}

impl ClientConfig {
    pub fn new(store_id: u64) -> Self {
        Self {
            store_id,
            endpoint: None,
            region: None,
            auth_endpoint: None,
            client_id: None,
            client_secret: None,
            provider: ProviderConfig::default(),
            retry: RetryPolicy::default(),
            allow_stale: false,
        }
    }

    /// Load config with precedence: env > .env > config.toml > defaults.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if no store id is configured anywhere, or if
    /// `VELLUM_STORE_ID` is not a number.
    pub fn load() -> Result<Self> {
        // Load .env from cwd (adds to env vars without overriding them)
        let _ = dotenvy::dotenv();

        let file = config_path().map(|p| load_config_toml(&p)).unwrap_or_default();
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    /// Load config from an explicit TOML file, still letting env override it.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::resolve(load_config_toml(path), |name| std::env::var(name).ok())
    }

    fn resolve<F>(file: ConfigToml, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        let store_id = match env(STORE_ID_ENV) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
                Error::invalid_argument(format!("{STORE_ID_ENV} is not a valid store id: {raw}"))
                    .with_source(e)
            })?,
            None => file.store_id.ok_or_else(|| {
                Error::invalid_argument(format!(
                    "no store id configured: set {STORE_ID_ENV} or store_id in config.toml"
                ))
            })?,
        };

        let mut config = Self::new(store_id);
        config.endpoint = env(ENDPOINT_ENV).or(file.endpoint);
        config.region = env(REGION_ENV).or(file.region);
        config.auth_endpoint = file.auth_endpoint;
        config.client_id = env(CLIENT_ID_ENV).or(file.client_id);
        config.client_secret = env(CLIENT_SECRET_ENV).or(file.client_secret);
        config.allow_stale = file.allow_stale.unwrap_or(false);
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_provider_config(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    /// The database endpoint after region derivation.
    pub fn database_endpoint(&self) -> String {
        make_endpoint(self.endpoint.as_deref(), self.region.as_deref())
    }

    pub fn auth_service_endpoint(&self) -> String {
        match self.auth_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => self.database_endpoint(),
        }
    }

    /// Resolve credentials, falling back to the environment.
    pub fn credentials(&self) -> Result<ClientCredentials> {
        ClientCredentials::resolve(self.client_id.clone(), self.client_secret.clone())
    }
}

/// Load a config.toml, returning defaults if it doesn't exist or can't be parsed.
fn load_config_toml(path: &Path) -> ConfigToml {
    let Ok(content) = std::fs::read_to_string(path) else {
        return ConfigToml::default();
    };
    match toml::from_str(&content) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unparseable config file");
            ConfigToml::default()
        }
    }
}

/// Get ~/.config/vellum/config.toml, honouring an absolute XDG_CONFIG_HOME.
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("vellum").join("config.toml"))
}
