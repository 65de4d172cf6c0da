//! Backing store collaborators.
//!
//! The engine never talks to a database directly. It goes through a
//! [`DocumentStore`], either the CouchDB-compatible [`HttpStore`] or the
//! in-process [`MemoryStore`], and every action gets its own [`StorePool`]
//! scoped to the caller's tenant and credentials.

pub mod http_store;
pub mod memory;
pub mod pool;
pub mod store;

pub use http_store::HttpStore;
pub use memory::MemoryStore;
pub use pool::{PoolConfig, StorePool};
pub use store::{DocumentStore, FetchOutcome, StoreMethod, StoreRequest, UserContext};
