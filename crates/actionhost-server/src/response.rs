//! Response channel.
//!
//! Every dispatch owns one [`ResponseChannel`]. Tenant code reaches it
//! through the `request` object; the dispatcher reaches it when something
//! fails outside tenant code. The channel enforces the event order described
//! in [`actionhost_common::ResponseEvent`]: a single buffered reply, or one
//! stream that is ended or aborted exactly once.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Resolving -> Compiling -> Executing -> Responded
//!                                         |
//!                                         +-> Streaming -> Ended
//! any non-terminal state -> Failed
//! ```
//!
//! Sandbox threads use the blocking methods; the dispatcher task uses the
//! async ones. State moves under the lock, events are sent after it is
//! released.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use actionhost_common::{ActionError, ResponseEvent, Result, StreamHead};
use futures::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use serde_json::Value;
use tokio::sync::mpsc;

use actionhost_common::transport::BoxedBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Created,
    Resolving,
    Compiling,
    Executing,
    Responded,
    Streaming,
    Ended,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Responded | DispatchState::Ended | DispatchState::Failed)
    }

    fn can_advance_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Created, Resolving)
                | (Resolving, Compiling)
                | (Compiling, Executing)
                | (Executing, Responded)
                | (Executing, Streaming)
                | (Streaming, Ended)
        ) || (next == Failed && !self.is_terminal())
    }
}

pub struct ResponseChannel {
    state: Mutex<DispatchState>,
    events: mpsc::Sender<ResponseEvent>,
}

impl ResponseChannel {
    /// Creates a channel and the receiving end handed to the HTTP layer.
    ///
    /// `buffer` bounds how many stream chunks may queue ahead of the client.
    pub fn new(buffer: usize) -> (Arc<Self>, ResponseReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let channel = Arc::new(Self {
            state: Mutex::new(DispatchState::Created),
            events: tx,
        });
        (channel, ResponseReceiver { events: rx })
    }

    pub fn state(&self) -> DispatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn advance(&self, next: DispatchState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_advance_to(next) {
            return Err(ActionError::IllegalResponse(format!(
                "cannot move from {:?} to {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }

    /// Applies a transition required by a tenant response call.
    ///
    /// The errors name the call the action made, since they surface to
    /// tenant code as exceptions.
    fn transition(&self, call: &str, from: DispatchState, to: DispatchState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ActionError::IllegalResponse(match *state {
                DispatchState::Responded => format!("{}: a response was already sent", call),
                DispatchState::Streaming => format!("{}: a stream is in progress", call),
                DispatchState::Ended => format!("{}: the stream already ended", call),
                DispatchState::Executing => format!("{}: no stream was started", call),
                other => format!("{}: not allowed while {:?}", call, other),
            }));
        }
        *state = to;
        Ok(())
    }

    fn blocking_emit(&self, event: ResponseEvent) -> Result<()> {
        self.events.blocking_send(event).map_err(|_| ActionError::Cancelled)
    }

    pub fn send_result(&self, body: Value) -> Result<()> {
        self.transition("sendResult", DispatchState::Executing, DispatchState::Responded)?;
        self.blocking_emit(ResponseEvent::ok(body))
    }

    pub fn send_error(&self, payload: Value) -> Result<()> {
        self.transition("sendError", DispatchState::Executing, DispatchState::Responded)?;
        self.blocking_emit(ResponseEvent::error(payload))
    }

    pub fn start_stream(&self, head: StreamHead) -> Result<()> {
        self.transition("startStream", DispatchState::Executing, DispatchState::Streaming)?;
        self.blocking_emit(ResponseEvent::StreamStart(head))
    }

    pub fn send_chunk(&self, chunk: Bytes) -> Result<()> {
        self.transition("sendChunk", DispatchState::Streaming, DispatchState::Streaming)?;
        self.blocking_emit(ResponseEvent::Chunk(chunk))
    }

    pub fn end_stream(&self) -> Result<()> {
        self.transition("endStream", DispatchState::Streaming, DispatchState::Ended)?;
        self.blocking_emit(ResponseEvent::StreamEnd)
    }

    /// Sends a buffered reply produced outside tenant code, such as the
    /// answer of an administrative action.
    pub async fn reply(&self, event: ResponseEvent) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() || *state == DispatchState::Streaming {
                return Err(ActionError::IllegalResponse(format!(
                    "cannot reply while {:?}",
                    *state
                )));
            }
            *state = DispatchState::Responded;
        }
        self.events.send(event).await.map_err(|_| ActionError::Cancelled)
    }

    /// Moves to `Failed` and returns the event to report `err` with, or
    /// `None` when the dispatch already reached a terminal state.
    fn fail_event(&self, err: &ActionError) -> Option<ResponseEvent> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if previous.is_terminal() {
            tracing::warn!("dropping failure after {:?}: {}", previous, err);
            return None;
        }
        *state = DispatchState::Failed;

        Some(match previous {
            DispatchState::Streaming => ResponseEvent::StreamAbort(err.to_string()),
            _ => ResponseEvent::Reply {
                status: err.status(),
                body: err.to_body(),
            },
        })
    }

    /// Reports `err` to the client as the final event.
    pub async fn fail(&self, err: &ActionError) {
        if let Some(event) = self.fail_event(err) {
            let _ = self.events.send(event).await;
        }
    }

    /// Blocking form of [`ResponseChannel::fail`].
    pub fn fail_blocking(&self, err: &ActionError) {
        if let Some(event) = self.fail_event(err) {
            let _ = self.events.blocking_send(event);
        }
    }

    /// Called once the action's code has returned and its jobs have run.
    ///
    /// An action that never responded is an error; an open stream is ended
    /// on its behalf.
    pub fn finish(&self) -> Result<()> {
        match self.state() {
            DispatchState::Executing => Err(ActionError::Runtime(
                "action completed without sending a response".into(),
            )),
            DispatchState::Streaming => {
                tracing::warn!("action returned with an open stream, ending it");
                self.end_stream()
            }
            _ => Ok(()),
        }
    }
}

/// The HTTP side of a [`ResponseChannel`].
pub struct ResponseReceiver {
    events: mpsc::Receiver<ResponseEvent>,
}

impl ResponseReceiver {
    pub async fn recv(&mut self) -> Option<ResponseEvent> {
        self.events.recv().await
    }

    /// Turns the remaining stream events into a response body.
    ///
    /// A `StreamAbort` ends the body with an error, which makes hyper cut
    /// the connection instead of finishing the chunked encoding cleanly.
    pub fn into_body(self) -> BoxedBody {
        let frames = stream::unfold(Some(self.events), |events| async move {
            let mut events = events?;
            match events.recv().await? {
                ResponseEvent::Chunk(bytes) => Some((Ok(Frame::data(bytes)), Some(events))),
                ResponseEvent::StreamEnd => None,
                ResponseEvent::StreamAbort(reason) => Some((Err(io::Error::other(reason)), None)),
                other => {
                    tracing::warn!("unexpected event inside a stream: {:?}", other);
                    Some((Err(io::Error::other("unexpected event inside a stream")), None))
                }
            }
        });
        StreamBody::new(frames).boxed()
    }

    /// Drains every event. Test helper.
    pub async fn collect(mut self) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.events.recv().await {
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    }
}
