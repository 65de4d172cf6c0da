//! HTTP Router
//!
//! Bridges hyper requests to the [`Dispatcher`] and turns the first response
//! event into an HTTP response: a buffered JSON reply, or a download whose
//! body follows the remaining stream events.

use std::sync::Arc;

use actionhost_common::transport::{HttpTransport, HyperResponse};
use actionhost_common::{ActionError, Credentials, ResponseEvent, Result};
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, COOKIE, HOST};
use hyper::Request;

use crate::dispatcher::Dispatcher;
use crate::router::{InboundRequest, RequestMethod};

pub struct ActionRouter {
    dispatcher: Arc<Dispatcher>,
}

impl ActionRouter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handles one HTTP request. Request errors become `{"error": ...}`
    /// replies; the error arm is left for failures of the connection itself.
    pub async fn handle_request<B>(&self, req: Request<B>) -> std::result::Result<HyperResponse, ActionError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let inbound = match self.read_request(req).await {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::debug!("rejecting request: {}", err);
                return Ok(HttpTransport::error_reply(&err));
            }
        };

        let mut receiver = self.dispatcher.dispatch(inbound);
        let response = match receiver.recv().await {
            Some(ResponseEvent::Reply { status, body }) => HttpTransport::json_reply(status, &body),
            Some(ResponseEvent::StreamStart(head)) => HttpTransport::stream_reply(&head, receiver.into_body()),
            Some(other) => {
                tracing::warn!("response began with {:?}", other);
                HttpTransport::error_reply(&ActionError::IllegalResponse(
                    "response did not start with a reply or a stream".into(),
                ))
            }
            None => HttpTransport::error_reply(&ActionError::Runtime(
                "request ended without a response".into(),
            )),
        };
        Ok(response)
    }

    async fn read_request<B>(&self, req: Request<B>) -> Result<InboundRequest>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = RequestMethod::parse(req.method().as_str())?;
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let credentials = Credentials {
            authorization: HttpTransport::header_string(&req, AUTHORIZATION),
            cookie: HttpTransport::header_string(&req, COOKIE),
        };
        let host = HttpTransport::header_string(&req, HOST);

        let limit = self.dispatcher.config().max_body_bytes;
        let body = Limited::new(req.into_body(), limit)
            .collect()
            .await
            .map_err(|e| ActionError::BadRequest(format!("request body rejected: {}", e)))?
            .to_bytes();

        Ok(InboundRequest {
            method,
            path,
            query,
            body,
            credentials,
            host,
        })
    }
}
