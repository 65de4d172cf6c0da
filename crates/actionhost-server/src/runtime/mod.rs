pub mod conversions;
pub mod sandbox;

mod bindings;
mod resolver;

#[cfg(test)]
mod tests;

pub use bindings::MAX_BUFFER_BYTES;
pub use sandbox::Sandbox;
