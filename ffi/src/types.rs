//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Request data crosses the boundary as a borrowed view: every pointer in an
//! `FfiRequest` points into buffers owned by Rust that live only for the
//! duration of the route callback. Completion data flows the other way and is
//! borrowed from the C caller for the duration of `embed_server_complete`.
//! Nothing here is freed by the other side.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Mutex;

use embed_http_core::{
    Completer, Context, EmbedServer, Handler, HandlerFault, Headers, Method, Reply, Request,
    ServerError, Token,
};

/// Opaque handle to an embedded server and the runtime that drives it.
pub struct FfiServer {
    pub(crate) runtime: tokio::runtime::Runtime,
    pub(crate) server: Mutex<EmbedServer>,
    /// Kept apart from `server` so completions never wait on `start`/`stop`.
    pub(crate) completer: Mutex<Option<Completer>>,
}

// ---------------------------------------------------------------------------
// Request view
// ---------------------------------------------------------------------------

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiHttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Delete = 3,
    Head = 4,
    Patch = 5,
    Options = 6,
}

impl From<Method> for FfiHttpMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => FfiHttpMethod::Get,
            Method::Post => FfiHttpMethod::Post,
            Method::Put => FfiHttpMethod::Put,
            Method::Delete => FfiHttpMethod::Delete,
            Method::Head => FfiHttpMethod::Head,
            Method::Patch => FfiHttpMethod::Patch,
            Method::Options => FfiHttpMethod::Options,
        }
    }
}

impl From<FfiHttpMethod> for Method {
    fn from(m: FfiHttpMethod) -> Self {
        match m {
            FfiHttpMethod::Get => Method::Get,
            FfiHttpMethod::Post => Method::Post,
            FfiHttpMethod::Put => Method::Put,
            FfiHttpMethod::Delete => Method::Delete,
            FfiHttpMethod::Head => Method::Head,
            FfiHttpMethod::Patch => Method::Patch,
            FfiHttpMethod::Options => Method::Options,
        }
    }
}

/// A key-value pair of C strings (headers, query and path parameters).
#[repr(C)]
pub struct FfiHeader {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Borrowed view of an inbound request, valid only inside the callback.
#[repr(C)]
pub struct FfiRequest {
    pub method: FfiHttpMethod,
    pub path: *const c_char,
    pub query: *const FfiHeader,
    pub query_len: u32,
    pub params: *const FfiHeader,
    pub params_len: u32,
    pub headers: *const FfiHeader,
    pub headers_len: u32,
    pub body: *const u8,
    pub body_len: usize,
}

/// Called on a server thread for every request to a C route.
///
/// The request is already deferred: answer it, now or later, by passing
/// `token` to `embed_server_complete`. Copy anything needed from `token` and
/// `request` before returning.
pub type FfiRequestCallback =
    extern "C" fn(user_data: *mut c_void, token: *const c_char, request: *const FfiRequest);

/// Owned storage behind an `FfiRequest`.
struct RequestView {
    _strings: Vec<CString>,
    _pairs: [Vec<FfiHeader>; 3],
    token: CString,
    ffi: FfiRequest,
}

fn c_string(s: &str) -> Result<CString, HandlerFault> {
    CString::new(s).map_err(|_| HandlerFault::new("request contains an interior NUL byte"))
}

impl RequestView {
    fn new(request: &Request, params: &[(String, String)], token: Token) -> Result<Self, HandlerFault> {
        let mut strings = Vec::new();
        let mut pairs_of = |items: Vec<(&str, &str)>| -> Result<Vec<FfiHeader>, HandlerFault> {
            let mut pairs = Vec::with_capacity(items.len());
            for (k, v) in items {
                let key = c_string(k)?;
                let value = c_string(v)?;
                pairs.push(FfiHeader {
                    key: key.as_ptr(),
                    value: value.as_ptr(),
                });
                strings.push(key);
                strings.push(value);
            }
            Ok(pairs)
        };
        let query = pairs_of(
            request
                .query()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        )?;
        let params = pairs_of(params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())?;
        let headers = pairs_of(request.headers().iter().collect())?;

        let path = c_string(request.path())?;
        let ffi = FfiRequest {
            method: request.method().into(),
            path: path.as_ptr(),
            query: query.as_ptr(),
            query_len: query.len() as u32,
            params: params.as_ptr(),
            params_len: params.len() as u32,
            headers: headers.as_ptr(),
            headers_len: headers.len() as u32,
            body: request.body().as_ptr(),
            body_len: request.body().len(),
        };
        strings.push(path);
        Ok(RequestView {
            _strings: strings,
            _pairs: [query, params, headers],
            token: c_string(&token.to_string())?,
            ffi,
        })
    }
}

/// Opaque user pointer handed back to the callback.
struct UserData(*mut c_void);

// The C caller promises `user_data` may be used from server threads.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// Route handler that forwards every request to a C callback.
pub(crate) struct CallbackHandler {
    callback: FfiRequestCallback,
    user_data: UserData,
}

impl CallbackHandler {
    pub(crate) fn new(callback: FfiRequestCallback, user_data: *mut c_void) -> Self {
        Self {
            callback,
            user_data: UserData(user_data),
        }
    }
}

impl Handler for CallbackHandler {
    fn handle(&self, request: &Request, ctx: &mut Context) -> Result<Reply, HandlerFault> {
        let token = ctx.defer()?;
        // The body pointer borrows from `request`, which outlives the call.
        let view = RequestView::new(request, ctx.params(), token)?;
        (self.callback)(self.user_data.0, view.token.as_ptr(), &view.ffi);
        Ok(Reply::Pending(token))
    }
}

// ---------------------------------------------------------------------------
// Completion input
// ---------------------------------------------------------------------------

/// Copy C headers into a core `Headers`. Null keys are skipped; invalid
/// UTF-8 is replaced.
pub(crate) fn headers_from_c(headers: *const FfiHeader, len: u32) -> Headers {
    let mut out = Headers::new();
    if headers.is_null() || len == 0 {
        return out;
    }
    let slice = unsafe { std::slice::from_raw_parts(headers, len as usize) };
    for h in slice {
        if h.key.is_null() {
            continue;
        }
        let key = unsafe { CStr::from_ptr(h.key) }.to_string_lossy().into_owned();
        let value = if h.value.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(h.value) }.to_string_lossy().into_owned()
        };
        out.insert(key, value);
    }
    out
}

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Status codes returned by every `embed_server_*` call that can fail.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    NullArg = 1,
    InvalidArg = 2,
    BindFailure = 3,
    AlreadyRunning = 4,
    DuplicateRoute = 5,
    InvalidPattern = 6,
    UnknownToken = 7,
    NotRunning = 8,
    Internal = 9,
    Panic = 10,
}

impl From<&ServerError> for FfiErrorCode {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::BindFailure { .. } => FfiErrorCode::BindFailure,
            ServerError::AlreadyRunning => FfiErrorCode::AlreadyRunning,
            ServerError::DuplicateRoute { .. } => FfiErrorCode::DuplicateRoute,
            ServerError::InvalidPattern { .. } => FfiErrorCode::InvalidPattern,
            ServerError::UnknownToken(_) => FfiErrorCode::UnknownToken,
            ServerError::Config(_) => FfiErrorCode::InvalidArg,
            _ => FfiErrorCode::Internal,
        }
    }
}

impl<T> From<Result<T, ServerError>> for FfiErrorCode {
    fn from(result: Result<T, ServerError>) -> Self {
        match result {
            Ok(_) => FfiErrorCode::Ok,
            Err(err) => FfiErrorCode::from(&err),
        }
    }
}
