// ABOUTME: List and sync result types plus the continuation token.
// ABOUTME: Tokens resume a list or sync it; they are restartable but not rewindable.

use vellum_grpc::{Error, Result};
use vellum_proto as proto;

pub use proto::SortDirection;

/// Opaque continuation handed back at the end of every list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListToken {
    pub token_data: Vec<u8>,
    /// More items exist past this page.
    pub can_continue: bool,
    /// The token may be passed to `sync_list`.
    pub can_sync: bool,
    pub schema_version_id: u32,
}

impl From<proto::ListToken> for ListToken {
    fn from(token: proto::ListToken) -> Self {
        Self {
            token_data: token.token_data,
            can_continue: token.can_continue,
            can_sync: token.can_sync,
            schema_version_id: token.schema_version_id,
        }
    }
}

impl ListToken {
    /// Extract the token from a terminal list message.
    pub(crate) fn from_finished(finished: proto::ListFinished) -> Result<Self> {
        finished
            .token
            .map(Self::from)
            .ok_or_else(|| Error::protocol("list finished without a continuation token"))
    }
}

/// Parameters for starting a list.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Maximum number of items; zero lets the server pick.
    pub limit: u32,
    pub sort_direction: SortDirection,
    /// Overrides the client's configured default when set.
    pub allow_stale: Option<bool>,
}

impl ListOptions {
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn descending(mut self) -> Self {
        self.sort_direction = SortDirection::Descending;
        self
    }

    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = Some(allow_stale);
        self
    }
}

/// Items of one list call and the token to resume it.
#[derive(Debug, Clone)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    pub token: ListToken,
}

/// Changes since a list token was issued.
#[derive(Debug, Clone)]
pub struct SyncResult<T> {
    /// The token could not be synced; callers must discard local state and
    /// rely on `changed` alone.
    pub reset: bool,
    pub changed: Vec<T>,
    pub deleted: Vec<String>,
    /// Keys that changed outside the window the token covers.
    pub updated_outside_window: Vec<String>,
    pub token: ListToken,
}

impl<T> SyncResult<T> {
    pub(crate) fn empty() -> Self {
        Self {
            reset: false,
            changed: Vec::new(),
            deleted: Vec::new(),
            updated_outside_window: Vec::new(),
            token: ListToken::default(),
        }
    }
}
