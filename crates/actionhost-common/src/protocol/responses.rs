//! Response events
//!
//! A dispatch never writes to a socket directly. The response channel turns
//! the calls tenant code makes on `request` into [`ResponseEvent`]s, and the
//! HTTP layer frames them.
//!
//! # Event Order
//!
//! A well-formed sequence is either a single [`ResponseEvent::Reply`] or
//! `StreamStart`, any number of `Chunk`s, then `StreamEnd` (or `StreamAbort`
//! when the action fails after bytes are already out).

use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header data announced when a progressive transfer starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    pub filename: String,
}

impl StreamHead {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// One buffered JSON reply.
    Reply { status: u16, body: Value },
    StreamStart(StreamHead),
    Chunk(Bytes),
    StreamEnd,
    /// The stream cannot be completed; already-sent bytes stay sent.
    StreamAbort(String),
}

impl ResponseEvent {
    pub fn ok(body: Value) -> Self {
        ResponseEvent::Reply { status: 200, body }
    }

    /// Error reply. A string payload is wrapped as `{"error": ...}`, any
    /// other payload is sent unchanged.
    pub fn error(payload: Value) -> Self {
        let body = match payload {
            Value::String(msg) => serde_json::json!({ "error": msg }),
            other => other,
        };
        ResponseEvent::Reply { status: 400, body }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseEvent::Reply { .. } | ResponseEvent::StreamEnd | ResponseEvent::StreamAbort(_)
        )
    }
}
