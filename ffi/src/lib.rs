//! C-ABI wrapper around `embed-http-core`.
//!
//! # Overview
//! Lets a native host (a mobile app shell, a desktop embedder) run the
//! embedded server without linking against tokio or Rust types: register C
//! callbacks as routes, start and stop the listener, and complete deferred
//! requests by token.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Each `FfiServer` owns a multi-threaded tokio runtime; `start`/`stop`
//!   block on it, request handling runs on its worker threads.
//! - Every C route is deferred: the callback receives a token and the host
//!   answers through `embed_server_complete`, from any thread, possibly from
//!   inside the callback itself.
//! - `embed_server_start`, `embed_server_stop` and `embed_server_free` must
//!   not be called from inside a route callback.

pub mod types;

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use embed_http_core::{EmbedServer, Response, ServerConfig, Token};
use tracing::warn;

use types::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Server lifecycle
// ---------------------------------------------------------------------------

/// Create a stopped server.
///
/// `config_json` may be null for defaults, or a JSON object with any of the
/// `ServerConfig` fields. Returns null if the configuration is invalid, the
/// runtime cannot be created, or an internal panic occurs.
/// The caller must free the returned pointer with `embed_server_free`.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_new(config_json: *const c_char) -> *mut FfiServer {
    catch_unwind(|| {
        let config = if config_json.is_null() {
            ServerConfig::default()
        } else {
            let raw = match unsafe { CStr::from_ptr(config_json) }.to_str() {
                Ok(raw) => raw,
                Err(_) => return std::ptr::null_mut(),
            };
            match serde_json::from_str::<ServerConfig>(raw) {
                Ok(config) if config.validate().is_ok() => config,
                Ok(_) | Err(_) => {
                    warn!("rejecting invalid server configuration");
                    return std::ptr::null_mut();
                }
            }
        };
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("embed-http")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "failed to create runtime");
                return std::ptr::null_mut();
            }
        };
        Box::into_raw(Box::new(FfiServer {
            runtime,
            server: Mutex::new(EmbedServer::new(config)),
            completer: Mutex::new(None),
        }))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Stop the server if it is running and free it. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_free(server: *mut FfiServer) {
    if server.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let server = unsafe { Box::from_raw(server) };
        lock(&server.completer).take();
        {
            let mut inner = lock(&server.server);
            if let Err(e) = server.runtime.block_on(inner.stop()) {
                warn!(error = %e, "stop during free failed");
            }
        }
        drop(server);
    }));
}

/// Register a route whose requests are forwarded to `callback`.
///
/// `pattern` is a path such as `/items/{id}`. Fails with `AlreadyRunning`
/// while the server is started.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_add_route(
    server: *const FfiServer,
    method: FfiHttpMethod,
    pattern: *const c_char,
    callback: Option<FfiRequestCallback>,
    user_data: *mut c_void,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() || pattern.is_null() {
            return FfiErrorCode::NullArg;
        }
        let Some(callback) = callback else {
            return FfiErrorCode::NullArg;
        };
        let server = unsafe { &*server };
        let pattern = match unsafe { CStr::from_ptr(pattern) }.to_str() {
            Ok(p) => p,
            Err(_) => return FfiErrorCode::InvalidArg,
        };
        let handler = CallbackHandler::new(callback, user_data);
        lock(&server.server)
            .route(method.into(), pattern, handler)
            .into()
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Bind `port` (0 for an ephemeral port) and start serving.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_start(server: *const FfiServer, port: u16) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() {
            return FfiErrorCode::NullArg;
        }
        let server = unsafe { &*server };
        let mut inner = lock(&server.server);
        let result = server.runtime.block_on(inner.start(port));
        if result.is_ok() {
            *lock(&server.completer) = inner.completer();
        }
        result.into()
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// The bound port, or 0 when the server is not running.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_port(server: *const FfiServer) -> u16 {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() {
            return 0;
        }
        let server = unsafe { &*server };
        lock(&server.server).local_addr().map_or(0, |addr| addr.port())
    }))
    .unwrap_or(0)
}

/// Stop serving. Parked requests are answered with 503 before this returns.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_stop(server: *const FfiServer) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() {
            return FfiErrorCode::NullArg;
        }
        let server = unsafe { &*server };
        lock(&server.completer).take();
        let mut inner = lock(&server.server);
        server.runtime.block_on(inner.stop()).into()
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Answer the request deferred under `token`.
///
/// `headers` and `body` are copied; either may be null when its length is 0.
/// Returns `UnknownToken` if the token was already completed or expired,
/// `NotRunning` if the server is stopped.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_complete(
    server: *const FfiServer,
    token: *const c_char,
    status: u16,
    headers: *const FfiHeader,
    headers_len: u32,
    body: *const u8,
    body_len: usize,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() || token.is_null() {
            return FfiErrorCode::NullArg;
        }
        if body.is_null() && body_len > 0 {
            return FfiErrorCode::NullArg;
        }
        let server = unsafe { &*server };
        let token: Token = match unsafe { CStr::from_ptr(token) }
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(token) => token,
            None => return FfiErrorCode::InvalidArg,
        };
        let Some(completer) = lock(&server.completer).clone() else {
            return FfiErrorCode::NotRunning;
        };

        let body = if body_len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(body, body_len) }.to_vec()
        };
        let response = Response {
            status,
            headers: headers_from_c(headers, headers_len),
            body,
        };
        if completer.complete(token, response) {
            FfiErrorCode::Ok
        } else {
            FfiErrorCode::UnknownToken
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Number of requests currently waiting for completion.
#[unsafe(no_mangle)]
pub extern "C" fn embed_server_pending_count(server: *const FfiServer) -> u32 {
    catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() {
            return 0;
        }
        let server = unsafe { &*server };
        lock(&server.completer)
            .as_ref()
            .map_or(0, |c| c.pending() as u32)
    }))
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
