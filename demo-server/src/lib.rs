//! Demo application for the embedded server.
//!
//! Registers a handful of routes that cover every way a handler can answer:
//!
//! | Route               | Behaviour                                          |
//! |---------------------|----------------------------------------------------|
//! | `GET /ping`         | `200 pong`                                         |
//! | `GET /hello/{name}` | `200 hello, {name}` (template parameter)           |
//! | `POST /echo`        | JSON description of the request                    |
//! | `GET /slow/{ms}`    | deferred, completed by a background task after `ms` |
//! | `GET /fault`        | handler failure, answered with 500                 |

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use embed_http_core::{
    Completer, Context, EmbedServer, HandlerFault, Method, Reply, Request, Response,
    ServerConfig, ServerResult, Token,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest delay `/slow/{ms}` accepts.
pub const MAX_DELAY_MS: u64 = 10_000;

/// A deferred `/slow` request waiting for the worker.
#[derive(Debug)]
pub struct Job {
    pub token: Token,
    pub delay: Duration,
}

/// Body returned by `POST /echo`.
#[derive(Debug, Serialize)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub body: String,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<mpsc::UnboundedReceiver<Job>>,
}

/// The embedded server plus the worker that completes deferred requests.
pub struct DemoApp {
    server: EmbedServer,
    jobs: Option<mpsc::UnboundedReceiver<Job>>,
    worker: Option<Worker>,
}

impl DemoApp {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut server = EmbedServer::new(config);
        register_routes(&mut server, tx)?;
        Ok(Self {
            server,
            jobs: Some(rx),
            worker: None,
        })
    }

    pub async fn start(&mut self, port: u16) -> ServerResult<SocketAddr> {
        let addr = self.server.start(port).await?;
        if let (Some(completer), Some(jobs)) = (self.server.completer(), self.jobs.take()) {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_worker(jobs, completer, shutdown_rx));
            self.worker = Some(Worker { shutdown, handle });
        }
        Ok(addr)
    }

    pub async fn stop(&mut self) -> ServerResult<()> {
        self.server.stop().await?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            match worker.handle.await {
                Ok(jobs) => self.jobs = Some(jobs),
                Err(e) => warn!(error = %e, "completion worker ended abnormally"),
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn pending_count(&self) -> usize {
        self.server.pending_count()
    }
}

fn register_routes(server: &mut EmbedServer, jobs: mpsc::UnboundedSender<Job>) -> ServerResult<()> {
    server
        .route(Method::Get, "/ping", ping)?
        .route(Method::Get, "/hello/{name}", hello)?
        .route(Method::Post, "/echo", echo)?
        .route(Method::Get, "/fault", fault)?
        .route(
            Method::Get,
            "/slow/{ms}",
            move |_: &Request, ctx: &mut Context| -> Result<Reply, HandlerFault> {
                let Some(ms) = ctx.param("ms").and_then(|ms| ms.parse::<u64>().ok()) else {
                    return Ok(Response::text(400, "delay must be a number of milliseconds").into());
                };
                if ms > MAX_DELAY_MS {
                    return Ok(Response::text(400, format!("delay is capped at {MAX_DELAY_MS} ms")).into());
                }
                let token = ctx.defer()?;
                jobs.send(Job {
                    token,
                    delay: Duration::from_millis(ms),
                })
                .map_err(|_| HandlerFault::new("completion worker is gone"))?;
                Ok(Reply::Pending(token))
            },
        )?;
    Ok(())
}

fn ping(_: &Request, _: &mut Context) -> Result<Reply, HandlerFault> {
    Ok(Response::text(200, "pong").into())
}

fn hello(_: &Request, ctx: &mut Context) -> Result<Reply, HandlerFault> {
    let name = ctx.param("name").unwrap_or("stranger");
    Ok(Response::text(200, format!("hello, {name}")).into())
}

fn echo(req: &Request, _: &mut Context) -> Result<Reply, HandlerFault> {
    let echo = Echo {
        method: req.method().to_string(),
        path: req.path().to_string(),
        query: req.query().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        content_type: req.header("content-type").map(str::to_string),
        body: String::from_utf8_lossy(req.body()).into_owned(),
    };
    let body = serde_json::to_vec(&echo).map_err(|e| HandlerFault::new(e.to_string()))?;
    Ok(Response::new(200)
        .with_header("Content-Type", "application/json")
        .with_body(body)
        .into())
}

fn fault(_: &Request, _: &mut Context) -> Result<Reply, HandlerFault> {
    Err(HandlerFault::new("the fault route always fails"))
}

/// Completes each job after its delay. Returns the job queue on shutdown so
/// the next run can reuse it.
async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    completer: Completer,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<Job> {
    info!("completion worker started");
    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let completer = completer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(job.delay).await;
                    let ms = job.delay.as_millis();
                    debug!(token = %job.token, ms, "completing slow request");
                    completer.complete(job.token, Response::text(200, format!("done after {ms} ms")));
                });
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    info!("completion worker stopped");
    jobs
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &[u8]) -> Request {
        Request::from_bytes(raw).unwrap()
    }

    #[test]
    fn echo_describes_the_request() {
        let req = request(
            b"POST /echo?b=2&a=1 HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
        );
        let Reply::Ready(resp) = echo(&req, &mut Context::detached(Vec::new())).unwrap() else {
            panic!("expected a ready reply");
        };
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["path"], "/echo");
        assert_eq!(value["query"]["a"], "1");
        assert_eq!(value["content_type"], "text/plain");
        assert_eq!(value["body"], "hi");
    }

    #[test]
    fn hello_uses_the_name_parameter() {
        let req = request(b"GET /hello/ada HTTP/1.1\r\n\r\n");
        let mut ctx = Context::detached(vec![("name".into(), "ada".into())]);
        let Reply::Ready(resp) = hello(&req, &mut ctx).unwrap() else {
            panic!("expected a ready reply");
        };
        assert_eq!(resp.body, b"hello, ada");
    }

    #[test]
    fn fault_route_fails() {
        let req = request(b"GET /fault HTTP/1.1\r\n\r\n");
        assert!(fault(&req, &mut Context::detached(Vec::new())).is_err());
    }

    #[test]
    fn routes_register_once() {
        let mut server = EmbedServer::new(ServerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        register_routes(&mut server, tx.clone()).unwrap();
        assert!(register_routes(&mut server, tx).is_err());
    }
}
