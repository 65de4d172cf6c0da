//! HTTP Server
//!
//! Accepts HTTP/1.1 connections and hands each request to the
//! [`ActionRouter`]. One tokio task per connection; the router spawns the
//! dispatch itself, so a slow action never stalls the accept loop.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use actionhost_client::HttpStore;
//! use actionhost_server::{Dispatcher, HttpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(HttpStore::new("http://127.0.0.1:5984").unwrap());
//!     let dispatcher = Arc::new(Dispatcher::new(store, ServerConfig::default()).unwrap());
//!     HttpServer::new(dispatcher)
//!         .run("127.0.0.1:5995".parse().unwrap())
//!         .await
//!         .unwrap();
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use actionhost_common::transport::{HyperRequest, HyperResponse};
use actionhost_common::{ActionError, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::dispatcher::Dispatcher;
use crate::http_router::ActionRouter;

pub struct HttpServer {
    router: Arc<ActionRouter>,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let router = Arc::new(ActionRouter::new(dispatcher));
        Self { router }
    }

    /// Binds `addr` and serves until the listener fails.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ActionError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "HTTP server listening on {}",
            listener
                .local_addr()
                .map_err(|e| ActionError::Transport(format!("Failed to get local address: {}", e)))?
        );

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ActionError::Transport(format!("Failed to accept connection: {}", e)))?;

            let io = TokioIo::new(stream);
            let router = self.router.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Self::handle_request(router, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::error!("Error serving connection from {}: {}", peer, err);
                }
            });
        }
    }

    async fn handle_request(
        router: Arc<ActionRouter>,
        req: HyperRequest,
    ) -> std::result::Result<HyperResponse, ActionError> {
        router.handle_request(req).await
    }
}
