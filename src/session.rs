//! Reconnect tokens and the sessions they resume.
//!
//! A token is minted against a set of bindings, either by a live channel that wants its client
//! to move to another gateway, or directly by a gateway handing out access to pre-bound actors.
//! The client presents the token in its handshake; the gateway redeems it from the shared
//! [`SessionStore`] and installs the bindings on the new channel under their original ids.
//!
//! Tokens are single use and expire after their time to live.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::{binding::Binding, channel::ChannelId, error::TokenError};

/// Default time to live of a reconnect token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// An unguessable, single use credential for resuming a session on another gateway.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconnectToken(Uuid);

impl ReconnectToken {
    /// Generates a new random token.
    pub fn generate() -> Self {
        ReconnectToken(Uuid::new_v4())
    }

    /// Returns the token as a uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReconnectToken({})", self.0.simple())
    }
}

impl FromStr for ReconnectToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ReconnectToken)
    }
}

/// A set of bindings waiting to be resumed.
#[derive(Clone, Debug)]
pub struct PendingSession {
    /// The bindings to install, with their original ids.
    pub bindings: Vec<Binding>,
    /// The channel the token was minted from, if any.
    pub origin: Option<ChannelId>,
    expires_at: Instant,
    redeemed: CancellationToken,
}

impl PendingSession {
    /// Returns `true` if the session can no longer be redeemed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Pending sessions, shared by every gateway that accepts the same tokens.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<ReconnectToken, PendingSession>>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a session and returns the token that redeems it.
    pub fn issue(
        &self,
        bindings: Vec<Binding>,
        origin: Option<ChannelId>,
        ttl: Duration,
    ) -> ReconnectToken {
        self.issue_tracked(bindings, origin, ttl).0
    }

    /// Like [`SessionStore::issue`], also returning a token cancelled once the session is
    /// redeemed.
    pub(crate) fn issue_tracked(
        &self,
        bindings: Vec<Binding>,
        origin: Option<ChannelId>,
        ttl: Duration,
    ) -> (ReconnectToken, CancellationToken) {
        let token = ReconnectToken::generate();
        let redeemed = CancellationToken::new();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| !session.is_expired());
        sessions.insert(
            token,
            PendingSession {
                bindings,
                origin,
                expires_at: Instant::now() + ttl,
                redeemed: redeemed.clone(),
            },
        );
        trace!(%token, ?origin, "reconnect token issued");
        (token, redeemed)
    }

    /// Consumes a token, returning its session.
    pub fn redeem(&self, token: &ReconnectToken) -> Result<PendingSession, TokenError> {
        let session = self
            .sessions
            .lock()
            .remove(token)
            .ok_or(TokenError::Unknown)?;
        if session.is_expired() {
            return Err(TokenError::Expired);
        }

        session.redeemed.cancel();
        trace!(%token, "reconnect token redeemed");
        Ok(session)
    }

    /// Invalidates a token, returning `false` if it was not pending.
    pub fn revoke(&self, token: &ReconnectToken) -> bool {
        self.sessions.lock().remove(token).is_some()
    }

    /// Returns `true` if the token is pending and not expired.
    pub fn contains(&self, token: &ReconnectToken) -> bool {
        self.sessions
            .lock()
            .get(token)
            .is_some_and(|session| !session.is_expired())
    }

    /// Drops every expired session, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired());
        before - sessions.len()
    }

    /// The number of pending sessions, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no sessions are pending.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("pending", &self.len())
            .finish()
    }
}
