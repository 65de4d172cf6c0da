//! HTTP Transport Utilities
//!
//! Hyper response builders for the two reply modes a dispatch can end in.
//!
//! # Example
//!
//! ```
//! use actionhost_common::transport::HttpTransport;
//! use serde_json::json;
//!
//! let response = HttpTransport::json_reply(200, &json!({"ok": true}));
//! assert_eq!(response.status(), 200);
//! ```

use std::io;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, EXPIRES, PRAGMA};
use hyper::{Request, Response, StatusCode};
use serde_json::Value;

use crate::protocol::{ActionError, StreamHead};

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Response body used for both buffered and streamed replies.
pub type BoxedBody = BoxBody<Bytes, io::Error>;

/// Type alias for Hyper responses
pub type HyperResponse = Response<BoxedBody>;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// A body holding `bytes` in one frame.
    pub fn full(bytes: impl Into<Bytes>) -> BoxedBody {
        Full::new(bytes.into()).map_err(|never| match never {}).boxed()
    }

    pub fn empty() -> BoxedBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }

    /// Serializes `body` as JSON followed by a newline.
    pub fn json_reply(status: u16, body: &Value) -> HyperResponse {
        let mut bytes = serde_json::to_vec(body).unwrap_or_default();
        bytes.push(b'\n');

        let mut response = Response::new(Self::full(bytes));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// The uniform `{"error": ...}` reply for `err`.
    pub fn error_reply(err: &ActionError) -> HyperResponse {
        Self::json_reply(err.status(), &err.to_body())
    }

    /// A download response whose body is produced progressively by `body`.
    pub fn stream_reply(head: &StreamHead, body: BoxedBody) -> HyperResponse {
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;

        let disposition = HeaderValue::from_str(&format!("attachment; filename={}", head.filename))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/force-download"));
        headers.insert(CONTENT_DISPOSITION, disposition);
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("must-revalidate, post-check=0, pre-check=0, public"),
        );
        headers.insert(EXPIRES, HeaderValue::from_static("0"));
        response
    }

    /// Reads a header as an owned string, dropping values that are not
    /// visible ASCII.
    pub fn header_string<B>(req: &Request<B>, name: HeaderName) -> Option<String> {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}
