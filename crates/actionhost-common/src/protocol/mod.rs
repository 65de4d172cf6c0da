pub mod error;
pub mod identifiers;
pub mod responses;


pub use error::{ActionError, Result};
pub use identifiers::{BundleId, BundleKey, Credentials, Revision, TenantId, DEFAULT_BUNDLE};
pub use responses::{ResponseEvent, StreamHead};
