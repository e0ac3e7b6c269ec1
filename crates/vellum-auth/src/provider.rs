// ABOUTME: TokenProvider caches one access token and refreshes it ahead of expiry.
// ABOUTME: Concurrent refreshes are coalesced into one shared in-flight fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vellum_grpc::{Error, ErrorKind, Result};

use crate::fetcher::{FetchedToken, TokenFetcher};

/// Lower bound of the renewal jitter band.
pub const DEFAULT_RENEWAL_JITTER_MIN: f64 = 0.90;
/// Upper bound of the renewal jitter band.
pub const DEFAULT_RENEWAL_JITTER_MAX: f64 = 0.95;
/// Tokens living less than this are refetched on demand, not renewed in the background.
pub const DEFAULT_MIN_RENEWABLE_LIFETIME: Duration = Duration::from_secs(1);

/// Configuration for a [`TokenProvider`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Renewal fires after `ttl * U[min, max]`.
    pub renewal_jitter_min: f64,
    pub renewal_jitter_max: f64,
    /// Shorter lifetimes (including zero) get no scheduled renewal.
    pub min_renewable_lifetime: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            renewal_jitter_min: DEFAULT_RENEWAL_JITTER_MIN,
            renewal_jitter_max: DEFAULT_RENEWAL_JITTER_MAX,
            min_renewable_lifetime: DEFAULT_MIN_RENEWABLE_LIFETIME,
        }
    }
}

impl ProviderConfig {
    /// Set the renewal jitter band.
    ///
    /// # Errors
    /// Returns `InvalidArgument` unless `0 < min <= max <= 1`.
    pub fn with_renewal_jitter(mut self, min: f64, max: f64) -> Result<Self> {
        if !(min > 0.0 && min <= max && max <= 1.0) {
            return Err(Error::invalid_argument(format!(
                "renewal jitter band must satisfy 0 < min <= max <= 1, got {min}..{max}"
            )));
        }
        self.renewal_jitter_min = min;
        self.renewal_jitter_max = max;
        Ok(self)
    }

    pub fn with_min_renewable_lifetime(mut self, lifetime: Duration) -> Self {
        self.min_renewable_lifetime = lifetime;
        self
    }

    /// When to renew a token with `lifetime` left, or `None` if it is too
    /// short-lived to renew ahead of expiry.
    fn renewal_delay(&self, lifetime: Duration) -> Option<Duration> {
        if lifetime.is_zero() || lifetime < self.min_renewable_lifetime {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(self.renewal_jitter_min..=self.renewal_jitter_max);
        Some(lifetime.mul_f64(jitter))
    }
}

/// The cached credential. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
struct TokenState {
    token: String,
    expires_at: Instant,
}

impl TokenState {
    fn from_fetched(fetched: FetchedToken, now: Instant) -> Self {
        Self {
            token: fetched.token,
            expires_at: now + fetched.ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// One in-flight fetch; every caller that needs a token awaits a clone of it.
type RefreshOperation = Shared<BoxFuture<'static, Result<TokenState>>>;

#[derive(Default)]
struct ProviderState {
    token: Option<TokenState>,
    refresh: Option<RefreshOperation>,
    refresh_task: Option<AbortHandle>,
    renewal: Option<JoinHandle<()>>,
}

struct ProviderInner {
    fetcher: Arc<dyn TokenFetcher>,
    config: ProviderConfig,
    state: Mutex<ProviderState>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Supplies a currently valid access token.
///
/// Clones share one cache. The provider must be started (inside a tokio
/// runtime) before [`get_token`](Self::get_token) succeeds.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<ProviderInner>,
}

impl TokenProvider {
    /// Create a provider with the default configuration.
    pub fn new<F: TokenFetcher>(fetcher: F) -> Self {
        Self::with_config(Arc::new(fetcher), ProviderConfig::default())
    }

    pub fn with_config(fetcher: Arc<dyn TokenFetcher>, config: ProviderConfig) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                fetcher,
                config,
                state: Mutex::new(ProviderState::default()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Begin background operation and dispatch the first refresh.
    ///
    /// Does not wait for the fetch. Repeated calls, and calls after
    /// [`close`](Self::close), are no-ops.
    pub fn start(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Token provider started");
        let mut state = self.inner.lock_state();
        drop(self.inner.refresh_locked(&mut state));
    }

    /// Return a currently valid token.
    ///
    /// A cached, unexpired token is returned without I/O unless `force` is
    /// set. Otherwise the caller joins the in-flight refresh (starting one if
    /// needed) and receives its result, error included. `force` drops the
    /// cached token first; it stays dropped if the forced refresh fails.
    pub async fn get_token(&self, force: bool) -> Result<String> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::Unauthenticated,
                "token provider has not been started",
            ));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::failed_precondition("token provider is closed"));
        }

        let refresh = {
            let mut state = self.inner.lock_state();
            if force {
                state.token = None;
            } else if let Some(cached) = state
                .token
                .as_ref()
                .filter(|t| !t.is_expired(Instant::now()))
            {
                return Ok(cached.token.clone());
            }
            self.inner.refresh_locked(&mut state)
        };

        refresh.await.map(|state| state.token)
    }

    /// Cancel renewal and any in-flight fetch, then release the fetcher.
    ///
    /// Idempotent; waiters still blocked on a fetch receive a `Cancelled` error.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.inner.lock_state();
            if let Some(renewal) = state.renewal.take() {
                renewal.abort();
            }
            if let Some(task) = state.refresh_task.take() {
                task.abort();
            }
            state.refresh = None;
        }

        self.inner.fetcher.close().await;
        info!("Token provider closed");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl ProviderInner {
    fn lock_state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the pending refresh, or dispatch a new one. Caller holds the lock,
    /// which makes the check-and-set of the slot atomic.
    fn refresh_locked(self: &Arc<Self>, state: &mut ProviderState) -> RefreshOperation {
        if let Some(pending) = &state.refresh {
            debug!("Joining in-flight token refresh");
            return pending.clone();
        }

        debug!("Dispatching token refresh");
        let task = tokio::spawn(Arc::clone(self).run_refresh());
        state.refresh_task = Some(task.abort_handle());

        let operation = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::new(ErrorKind::Cancelled, "token refresh was cancelled")
                    .with_source(e)),
            }
        }
        .boxed()
        .shared();

        state.refresh = Some(operation.clone());
        operation
    }

    async fn run_refresh(self: Arc<Self>) -> Result<TokenState> {
        let result = self.fetcher.fetch().await;

        let mut state = self.lock_state();
        state.refresh = None;
        state.refresh_task = None;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                // The cached token (if any) is left in place for non-forced callers.
                warn!(error = %err, "Token refresh failed");
                return Err(err);
            }
        };

        let now = Instant::now();
        let fresh = TokenState::from_fetched(fetched, now);
        let current = match state.token.take() {
            Some(cached) if cached.expires_at > fresh.expires_at => {
                debug!("Keeping cached token with the later expiry");
                cached
            }
            _ => fresh,
        };
        state.token = Some(current.clone());

        if !self.closed.load(Ordering::SeqCst) {
            self.schedule_renewal_locked(&mut state, current.expires_at.saturating_duration_since(now));
        }

        Ok(current)
    }

    /// Replace any pending renewal with one firing shortly before expiry.
    fn schedule_renewal_locked(self: &Arc<Self>, state: &mut ProviderState, lifetime: Duration) {
        if let Some(previous) = state.renewal.take() {
            previous.abort();
        }

        let Some(delay) = self.config.renewal_delay(lifetime) else {
            debug!(
                lifetime_ms = lifetime.as_millis() as u64,
                "Token too short-lived to renew ahead of expiry"
            );
            return;
        };
        debug!(delay_ms = delay.as_millis() as u64, "Scheduled token renewal");

        let weak = Arc::downgrade(self);
        state.renewal = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            debug!("Renewing token ahead of expiry");
            let mut state = inner.lock_state();
            drop(inner.refresh_locked(&mut state));
        }));
    }
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(renewal) = state.renewal.take() {
            renewal.abort();
        }
    }
}
