//! actionhost transport layer
//!
//! HTTP framing for dispatch results. Buffered replies become a JSON body
//! terminated by a newline; streamed transfers become a chunked download.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: builders for buffered, error and streaming replies
//! - **[`HyperRequest`]** / **[`HyperResponse`]**: hyper type aliases shared by
//!   the server and its tests

pub mod http;

pub use http::{BoxedBody, HttpTransport, HyperRequest, HyperResponse};
