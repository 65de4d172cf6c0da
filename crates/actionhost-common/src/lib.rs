//! actionhost common types and HTTP framing
//!
//! This crate holds everything the other actionhost crates agree on:
//!
//! - **Protocol Layer**: tenant and bundle identifiers, revision tokens, caller
//!   credentials, the error taxonomy and the events a response channel emits
//! - **Transport Layer**: turning those events into hyper responses
//!
//! # Components
//!
//! - [`protocol`] - identifiers, [`ActionError`], [`ResponseEvent`]
//! - [`transport`] - [`HttpTransport`](transport::HttpTransport) framing helpers
//!
//! # Example
//!
//! ```
//! use actionhost_common::{ActionError, BundleId, TenantId};
//!
//! let tenant = TenantId::new("db1").unwrap();
//! let bundle = BundleId::default();
//! assert_eq!(bundle.to_string(), "design/datamanager");
//!
//! let err = ActionError::UnknownAction("list".into());
//! assert_eq!(err.to_body()["error"], "unknown action list");
//! # let _ = tenant;
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
