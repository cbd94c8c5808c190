//! Handler capability and per-request context.
//!
//! A handler runs synchronously on the connection task. It either answers at
//! once with [`Reply::Ready`] or calls [`Context::defer`] and returns
//! [`Reply::Pending`] with the token it got; the application then finishes
//! the request later through a `Completer`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{HandlerFault, ServerError, ServerResult};
use crate::http::{Request, Response};
use crate::pending::{PendingRegistry, Token};

/// What a handler produced for a request.
#[derive(Debug)]
pub enum Reply {
    Ready(Response),
    Pending(Token),
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Ready(response)
    }
}

/// Application logic bound to a route.
///
/// Implemented for any `Fn(&Request, &mut Context) -> Result<Reply, HandlerFault>`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request, ctx: &mut Context) -> Result<Reply, HandlerFault>;
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Context) -> Result<Reply, HandlerFault> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, ctx: &mut Context) -> Result<Reply, HandlerFault> {
        self(request, ctx)
    }
}

/// Per-request state handed to a handler.
pub struct Context {
    params: Vec<(String, String)>,
    registry: Arc<PendingRegistry>,
    deferred: Option<(Token, oneshot::Receiver<Response>)>,
    refused: bool,
}

impl Context {
    pub(crate) fn new(params: Vec<(String, String)>, registry: Arc<PendingRegistry>) -> Self {
        Self {
            params,
            registry,
            deferred: None,
            refused: false,
        }
    }

    /// A context outside any running server, for calling handlers directly.
    /// Deferred tokens land in a private registry nobody completes.
    pub fn detached(params: Vec<(String, String)>) -> Self {
        Self::new(params, Arc::new(PendingRegistry::new(Duration::from_secs(30))))
    }

    /// Value of the `{name}` template segment that matched this request.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Park this request and return the token that completes it.
    ///
    /// Calling it again returns the same token. Fails with `ServerShutdown`
    /// while the server is stopping.
    pub fn defer(&mut self) -> ServerResult<Token> {
        if let Some((token, _)) = &self.deferred {
            return Ok(*token);
        }
        let (tx, rx) = oneshot::channel();
        match self.registry.register(tx) {
            Ok(token) => {
                self.deferred = Some((token, rx));
                Ok(token)
            }
            Err(err) => {
                self.refused = true;
                Err(err)
            }
        }
    }

    pub(crate) fn take_deferred(&mut self) -> Option<(Token, oneshot::Receiver<Response>)> {
        self.deferred.take()
    }

    /// Whether `defer` failed because the server is shutting down.
    pub(crate) fn refused(&self) -> bool {
        self.refused
    }
}

impl From<ServerError> for HandlerFault {
    fn from(err: ServerError) -> Self {
        HandlerFault(err.to_string())
    }
}
