//! Accept loop, connection tasks and dispatch.
//!
//! # Design
//! One task accepts connections and spawns a task per connection into a
//! `JoinSet`, so shutdown can wait for every connection to finish. A
//! connection task reads until a full request is buffered, dispatches it,
//! writes the response and loops while keep-alive allows. A deferred request
//! parks only its own connection task on a `oneshot` receiver; the acceptor
//! never waits on handlers.
//!
//! Errors never escape a connection task: parse failures become 400/413,
//! missing routes 404/405, handler faults and panics 500.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{Context, Reply};
use crate::http::{parse_request, Method, Parsed, Request, Response};
use crate::pending::PendingRegistry;
use crate::router::RouteTable;

/// State shared by the acceptor and every connection task.
pub(crate) struct Shared {
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) registry: Arc<PendingRegistry>,
    pub(crate) config: ServerConfig,
}

/// Accept connections until `shutdown` flips, then drain connection tasks.
pub(crate) async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        shared.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task failed");
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    drop(listener);

    let open = connections.len();
    let drained = tokio::time::timeout(shared.config.shutdown_grace(), async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "aborting connections after shutdown grace period"
        );
        connections.shutdown().await;
    }
    info!(connections = open, "acceptor stopped");
}

/// Periodically expire deferred requests past their deadline.
pub(crate) async fn sweep(
    registry: Arc<PendingRegistry>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = registry.expire_due(Instant::now());
                if expired > 0 {
                    debug!(expired, pending = registry.len(), "sweep expired deferred requests");
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}

/// Resolves once the shutdown flag is set, or the controller is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

enum ReadError {
    Io(std::io::Error),
    Parse(ServerError),
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = Vec::with_capacity(4096);
    loop {
        let request = match read_request(&mut stream, &mut buf, &shared.config, &mut shutdown).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(ReadError::Io(e)) => {
                debug!(%peer, error = %e, "connection read failed");
                break;
            }
            Err(ReadError::Parse(err)) => {
                warn!(%peer, error = %err, "rejecting request");
                let _ = write_response(&mut stream, &Response::error(err.status()), true, false).await;
                break;
            }
        };

        let started = Instant::now();
        let response = dispatch(&shared, &request).await;
        let close = !shared.config.keep_alive || !request.keep_alive() || *shutdown.borrow();
        debug!(
            %peer,
            method = %request.method(),
            path = request.path(),
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
        let head_only = request.method() == Method::Head;
        if let Err(e) = write_response(&mut stream, &response, close, head_only).await {
            debug!(%peer, error = %e, "response write failed");
            break;
        }
        if close {
            break;
        }
    }
    let _ = stream.shutdown().await;
}

/// Read until `buf` holds a complete request; `None` on a clean close.
async fn read_request(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    config: &ServerConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Request>, ReadError> {
    let mut chunk = [0u8; 8192];
    loop {
        if !buf.is_empty() {
            match parse_request(buf, config.max_request_bytes).map_err(ReadError::Parse)? {
                Parsed::Complete(request, consumed) => {
                    buf.drain(..consumed);
                    return Ok(Some(request));
                }
                Parsed::Partial => {}
            }
        }

        let read = tokio::select! {
            read = tokio::time::timeout(config.idle_timeout(), stream.read(&mut chunk)) => read,
            _ = stopped(shutdown) => return Ok(None),
        };
        match read {
            Err(_) => {
                debug!("closing idle connection");
                return Ok(None);
            }
            Ok(Err(e)) => return Err(ReadError::Io(e)),
            Ok(Ok(0)) if buf.is_empty() => return Ok(None),
            Ok(Ok(0)) => {
                return Err(ReadError::Parse(ServerError::MalformedRequest(
                    "connection closed before the request was complete".into(),
                )))
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// `head_only` omits the body, as a reply to `HEAD` must.
async fn write_response(
    stream: &mut TcpStream,
    response: &Response,
    close: bool,
    head_only: bool,
) -> ServerResult<()> {
    let encode = |response: &Response| {
        if head_only {
            response.encode_head(close)
        } else {
            response.encode(close)
        }
    };
    let bytes = match encode(response) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, status = response.status, "dropping unencodable response");
            encode(&Response::error(500))?
        }
    };
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Resolve, run the handler and wait for a deferred reply if there is one.
pub(crate) async fn dispatch(shared: &Shared, request: &Request) -> Response {
    let matched = match shared.routes.resolve(request.method(), request.path()) {
        Ok(matched) => matched,
        Err(_) => return unrouted(shared, request),
    };
    let pattern = matched.pattern.to_string();
    let mut ctx = Context::new(matched.params, shared.registry.clone());
    let outcome = catch_unwind(AssertUnwindSafe(|| matched.handler.handle(request, &mut ctx)));
    let deferred = ctx.take_deferred();

    let fault = match outcome {
        Ok(Ok(Reply::Ready(response))) => {
            withdraw(shared, deferred.map(|(token, _)| token));
            return response;
        }
        Ok(Ok(Reply::Pending(token))) => match deferred {
            Some((deferred_token, rx)) if deferred_token == token => return park(rx).await,
            other => {
                withdraw(shared, other.map(|(token, _)| token));
                format!("handler returned token {token} it did not defer")
            }
        },
        Ok(Err(fault)) => {
            withdraw(shared, deferred.map(|(token, _)| token));
            fault.to_string()
        }
        Err(panic) => {
            withdraw(shared, deferred.map(|(token, _)| token));
            panic_message(panic.as_ref())
        }
    };

    if ctx.refused() {
        return Response::error(503);
    }
    error!(
        method = %request.method(),
        path = request.path(),
        route = %pattern,
        fault = %fault,
        "handler failed"
    );
    Response::error(500)
}

async fn park(rx: oneshot::Receiver<Response>) -> Response {
    match rx.await {
        Ok(response) => response,
        // The registry only drops a sender without replying if it is torn down.
        Err(_) => Response::error(503),
    }
}

fn withdraw(shared: &Shared, token: Option<crate::pending::Token>) {
    if let Some(token) = token {
        shared.registry.cancel(token);
    }
}

fn unrouted(shared: &Shared, request: &Request) -> Response {
    if shared.config.method_not_allowed {
        let allowed = shared.routes.allowed_methods(request.path());
        if !allowed.is_empty() {
            let allow: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
            return Response::error(405).with_header("Allow", allow.join(", "));
        }
    }
    Response::error(404)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}
