//! Error types for the embedded server.
//!
//! # Design
//! One enum covers every failure the server can report. Parse and routing
//! errors never leave a connection task: they are mapped to an HTTP status
//! with [`ServerError::status`] and written back to the client. Lifecycle
//! errors are returned to the caller of `start` / `route`. Handler failures
//! use the separate [`HandlerFault`] type so application code cannot return
//! lifecycle variants from a handler.

use std::net::SocketAddr;

use thiserror::Error;

use crate::http::Method;
use crate::pending::Token;

/// Errors produced by the server, its parser and its registries.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request bytes do not form a valid HTTP/1.x request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request head or body exceeds the configured size limit.
    #[error("request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// A response cannot be serialized (bad status or header).
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A route pattern could not be parsed.
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no route for {method} {path}")]
    NoRoute { method: Method, path: String },

    #[error("route already registered: {method} {pattern}")]
    DuplicateRoute { method: Method, pattern: String },

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is shutting down")]
    ServerShutdown,

    #[error("handler fault: {0}")]
    HandlerFault(#[from] HandlerFault),

    /// Completion for a token that is not pending (already completed,
    /// expired, or never issued by this instance).
    #[error("unknown token {0}")]
    UnknownToken(Token),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// The HTTP status written to the client when this error ends a request.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::MalformedRequest(_) => 400,
            ServerError::RequestTooLarge { .. } => 413,
            ServerError::NoRoute { .. } => 404,
            ServerError::ServerShutdown => 503,
            _ => 500,
        }
    }
}

/// A failure raised by application handler code.
///
/// Converted to a `500` response by the server core and logged.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerFault(pub String);

impl HandlerFault {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerFault(msg.into())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
