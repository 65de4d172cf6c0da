//! Actionhost Server
//!
//! Executes tenant-supplied JavaScript actions on behalf of HTTP callers.
//! Bundles are fetched from the backing store, revalidated by revision on
//! every request and compiled once per revision; each action then runs in a
//! fresh Boa context with a store pool scoped to its caller.

pub mod admin;
pub mod bundle;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod document_cache;
pub mod http_router;
pub mod http_server;
pub mod resource_limits;
pub mod response;
pub mod router;
pub mod runtime;
pub mod script_cache;

pub use admin::{AdminHandler, DisabledAdmin};
pub use bundle::TenantBundle;
pub use config::{CacheConfig, ServerConfig};
pub use dispatcher::Dispatcher;
pub use document_cache::{CacheOutcome, DocumentCache};
pub use http_server::HttpServer;
pub use resource_limits::ResourceLimits;
pub use response::{DispatchState, ResponseChannel, ResponseReceiver};
pub use router::{InboundRequest, RequestMethod};
pub use runtime::Sandbox;
