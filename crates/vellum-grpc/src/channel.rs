// ABOUTME: Resolves the vellum service endpoint and builds tonic channels for it.
// ABOUTME: HTTP/2 pings keep long transaction streams alive through load balancers.

use std::time::Duration;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::Error;

/// Endpoint used when neither an endpoint nor a region is configured.
pub const DEFAULT_ENDPOINT: &str = "https://api.vellum.cloud";

/// Resolve the service endpoint.
///
/// An explicit endpoint wins. Otherwise a region maps to
/// `https://{region}.api.vellum.cloud`, with any `aws-` prefix dropped.
pub fn make_endpoint(endpoint: Option<&str>, region: Option<&str>) -> String {
    if let Some(endpoint) = endpoint.map(str::trim).filter(|e| !e.is_empty()) {
        return endpoint.to_string();
    }
    match region.map(str::trim).filter(|r| !r.is_empty()) {
        Some(region) => {
            let region = region.strip_prefix("aws-").unwrap_or(region);
            format!("https://{region}.api.vellum.cloud")
        }
        None => DEFAULT_ENDPOINT.to_string(),
    }
}

/// HTTP/2 ping settings.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    /// A ping unanswered for this long marks the connection dead.
    pub timeout: Duration,
    /// Ping even with no open streams.
    pub while_idle: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
            while_idle: true,
        }
    }
}

/// How to reach one vellum endpoint.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub address: String,
    pub keep_alive: Option<KeepAliveConfig>,
    pub connect_timeout: Option<Duration>,
    /// On for `https://` addresses.
    pub use_tls: bool,
}

impl ChannelConfig {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into().trim().to_string();
        let use_tls = address
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
        Self {
            address,
            keep_alive: Some(KeepAliveConfig::default()),
            connect_timeout: Some(Duration::from_secs(30)),
            use_tls,
        }
    }

    /// Config for the endpoint that [`make_endpoint`] resolves.
    pub fn resolve(endpoint: Option<&str>, region: Option<&str>) -> Self {
        Self::new(make_endpoint(endpoint, region))
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn endpoint(&self) -> Result<Endpoint, Error> {
        let mut endpoint = Endpoint::from_shared(self.address.clone()).map_err(|e| {
            Error::invalid_argument(format!("invalid endpoint {:?}: {e}", self.address))
                .with_source(e)
        })?;

        if self.use_tls {
            endpoint = endpoint.tls_config(ClientTlsConfig::new())?;
        }
        if let Some(ka) = &self.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(ka.interval)
                .keep_alive_timeout(ka.timeout)
                .keep_alive_while_idle(ka.while_idle);
        }
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        Ok(endpoint)
    }

    /// Build a channel that connects on first use.
    pub fn connect_lazy(&self) -> Result<Channel, Error> {
        Ok(self.endpoint()?.connect_lazy())
    }
}

/// Connect a channel, failing with `Unavailable` if the endpoint is unreachable.
pub async fn create_channel(config: &ChannelConfig) -> Result<Channel, Error> {
    let channel = config.endpoint()?.connect().await?;

    tracing::debug!(
        address = %config.address,
        keep_alive = config.keep_alive.is_some(),
        use_tls = config.use_tls,
        "gRPC channel connected"
    );

    Ok(channel)
}

/// Connect without keep-alive, for short unary traffic such as token fetches.
pub async fn create_simple_channel(address: &str) -> Result<Channel, Error> {
    create_channel(&ChannelConfig::new(address).without_keep_alive()).await
}
