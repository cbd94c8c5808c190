//! Pending-operation registry for deferred handler replies.
//!
//! # Design
//! A handler that cannot answer immediately defers: the connection task
//! registers the sending half of a `oneshot` channel here and awaits the
//! receiving half. Whoever holds the [`Token`] later completes it, which
//! removes the entry and hands the response to the parked connection.
//!
//! Every removal path (complete, expire, cancel, close) takes the entry out of
//! the map under the lock, so a token resolves at most once. The lock is a
//! plain `std::sync::Mutex`: critical sections are a map operation and never
//! await. Channel sends happen after the guard is dropped.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use crate::http::Response;

/// Opaque identifier correlating a parked request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(Uuid);

impl Token {
    fn generate() -> Self {
        Token(Uuid::new_v4())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Token {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Token)
    }
}

struct PendingOperation {
    reply: oneshot::Sender<Response>,
    created: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<Token, PendingOperation>,
    closed: bool,
}

/// Table of in-flight deferred requests keyed by token.
pub struct PendingRegistry {
    timeout: Duration,
    state: Mutex<State>,
}

impl PendingRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a connection: store its reply channel under a fresh token.
    ///
    /// Fails with `ServerShutdown` once [`close`](Self::close) has run.
    pub fn register(&self, reply: oneshot::Sender<Response>) -> ServerResult<Token> {
        let mut state = self.lock();
        if state.closed {
            return Err(ServerError::ServerShutdown);
        }
        let created = Instant::now();
        let mut token = Token::generate();
        while state.entries.contains_key(&token) {
            token = Token::generate();
        }
        state.entries.insert(
            token,
            PendingOperation {
                reply,
                created,
                deadline: created + self.timeout,
            },
        );
        debug!(%token, pending = state.entries.len(), "request deferred");
        Ok(token)
    }

    /// Deliver `response` to the connection parked under `token`.
    ///
    /// Fails with `UnknownToken` if the token was already completed, expired
    /// or never issued.
    pub fn complete(&self, token: Token, response: Response) -> ServerResult<()> {
        let op = self
            .lock()
            .entries
            .remove(&token)
            .ok_or(ServerError::UnknownToken(token))?;
        debug!(
            %token,
            status = response.status,
            elapsed_ms = op.created.elapsed().as_millis() as u64,
            "deferred request completed"
        );
        deliver(token, op, response);
        Ok(())
    }

    /// Answer the request parked under `token` with `504 Gateway Timeout`.
    pub fn expire(&self, token: Token) -> ServerResult<()> {
        let op = self
            .lock()
            .entries
            .remove(&token)
            .ok_or(ServerError::UnknownToken(token))?;
        warn!(%token, "deferred request timed out");
        deliver(token, op, Response::error(504));
        Ok(())
    }

    /// Expire every entry whose deadline is at or before `now`.
    ///
    /// Returns the number of entries expired.
    pub fn expire_due(&self, now: Instant) -> usize {
        let due: Vec<(Token, PendingOperation)> = {
            let mut state = self.lock();
            let tokens: Vec<Token> = state
                .entries
                .iter()
                .filter(|(_, op)| op.deadline <= now)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| state.entries.remove(&token).map(|op| (token, op)))
                .collect()
        };
        let count = due.len();
        for (token, op) in due {
            warn!(%token, "deferred request timed out");
            deliver(token, op, Response::error(504));
        }
        count
    }

    /// Withdraw an entry without answering it.
    pub fn cancel(&self, token: Token) -> bool {
        self.lock().entries.remove(&token).is_some()
    }

    /// Refuse new registrations and answer every parked request with
    /// `503 Service Unavailable`. Returns the number of requests failed.
    pub fn close(&self) -> usize {
        let drained: Vec<(Token, PendingOperation)> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (token, op) in drained {
            deliver(token, op, Response::error(503));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(token: Token, op: PendingOperation, response: Response) {
    if op.reply.send(response).is_err() {
        debug!(%token, "client went away before the deferred reply");
    }
}
