//! Embedded local HTTP server with deferred request completion.
//!
//! # Overview
//! A host process registers routes, starts the server on a loopback port and
//! answers requests either directly from a handler or later, from anywhere,
//! by completing the token the handler deferred.
//!
//! # Design
//! - `http`: immutable `Request`, plain-data `Response`, incremental parser.
//! - `router`: `(method, pattern)` table with literal-over-template ranking.
//! - `pending`: token-keyed registry of parked requests with expiry.
//! - `server`: accept loop and per-connection tasks on tokio.
//! - `lifecycle`: `EmbedServer` start/stop/complete for the host.
//! - Errors are `thiserror` enums; logging goes through `tracing` and the
//!   host decides where it ends up.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod lifecycle;
pub mod pending;
pub mod router;
mod server;

pub use config::ServerConfig;
pub use error::{HandlerFault, ServerError, ServerResult};
pub use handler::{Context, Handler, Reply};
pub use http::{Headers, Method, Request, Response};
pub use lifecycle::{Completer, EmbedServer};
pub use pending::{PendingRegistry, Token};
pub use router::RouteTable;
