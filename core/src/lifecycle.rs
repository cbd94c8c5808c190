//! Lifecycle controller exposed to the controlling process.
//!
//! # Design
//! `EmbedServer` owns the route table while stopped and hands an immutable
//! snapshot to the running server, so routes cannot change during a listen.
//! Each `start` gets a fresh pending registry; tokens from an earlier run are
//! unknown to the next one.
//!
//! `stop` orders shutdown so nothing is left dangling: flip the shutdown flag
//! (the acceptor and idle connections exit), close the registry (every parked
//! request is answered with 503 and no new ones are accepted), then join the
//! acceptor, which in turn joins every connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::Handler;
use crate::http::{Headers, Method, Response};
use crate::pending::{PendingRegistry, Token};
use crate::router::RouteTable;
use crate::server::{self, Shared};

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    registry: Arc<PendingRegistry>,
    acceptor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// An embedded HTTP server driven by its host.
pub struct EmbedServer {
    config: ServerConfig,
    routes: RouteTable,
    running: Option<Running>,
}

impl EmbedServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: RouteTable::new(),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a route. Fails with `AlreadyRunning` while listening.
    pub fn route<H: Handler>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> ServerResult<&mut Self> {
        self.route_arc(method, pattern, Arc::new(handler))
    }

    pub fn route_arc(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> ServerResult<&mut Self> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        self.routes.register_arc(method, pattern, handler)?;
        Ok(self)
    }

    /// Bind `config.host:port` and start serving. Port 0 picks a free port.
    pub async fn start(&mut self, port: u16) -> ServerResult<SocketAddr> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        self.config.validate()?;

        let addr = SocketAddr::new(self.config.host, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailure { addr, source })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(PendingRegistry::new(self.config.pending_timeout()));
        let shared = Arc::new(Shared {
            routes: Arc::new(self.routes.clone()),
            registry: registry.clone(),
            config: self.config.clone(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(server::serve(listener, shared, shutdown_rx.clone()));
        let sweeper = tokio::spawn(server::sweep(
            registry.clone(),
            self.config.clone(),
            shutdown_rx,
        ));

        info!(addr = %local_addr, routes = self.routes.len(), "embedded server listening");
        self.running = Some(Running {
            local_addr,
            shutdown,
            registry,
            acceptor,
            sweeper,
        });
        Ok(local_addr)
    }

    /// Stop accepting, fail parked requests and wait for connections to end.
    ///
    /// Does nothing when the server is not running.
    pub async fn stop(&mut self) -> ServerResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        let failed = running.registry.close();
        if let Err(e) = running.acceptor.await {
            warn!(error = %e, "acceptor task ended abnormally");
        }
        if let Err(e) = running.sweeper.await {
            warn!(error = %e, "sweep task ended abnormally");
        }
        info!(addr = %running.local_addr, failed_pending = failed, "embedded server stopped");
        Ok(())
    }

    /// Complete a deferred request. Returns `false` (and logs) when the
    /// token is not pending, including when the server is stopped.
    pub fn complete(&self, token: Token, response: Response) -> bool {
        match self.completer() {
            Some(completer) => completer.complete(token, response),
            None => {
                warn!(%token, "completion while the server is stopped");
                false
            }
        }
    }

    /// A cloneable completion handle for the current run.
    pub fn completer(&self) -> Option<Completer> {
        self.running.as_ref().map(|r| Completer {
            registry: r.registry.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn pending_count(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.registry.len())
    }
}

impl Drop for EmbedServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.registry.close();
        }
    }
}

/// Completion interface handed to application code.
///
/// Completing a token twice, or after it expired, is logged and ignored.
#[derive(Clone)]
pub struct Completer {
    registry: Arc<PendingRegistry>,
}

impl Completer {
    pub fn complete(&self, token: Token, response: Response) -> bool {
        match self.registry.complete(token, response) {
            Ok(()) => true,
            Err(err) => {
                warn!(%token, error = %err, "ignoring completion");
                false
            }
        }
    }

    pub fn complete_parts(
        &self,
        token: Token,
        status: u16,
        headers: Headers,
        body: Vec<u8>,
    ) -> bool {
        self.complete(
            token,
            Response {
                status,
                headers,
                body,
            },
        )
    }

    pub fn pending(&self) -> usize {
        self.registry.len()
    }
}
