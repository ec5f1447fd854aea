//! Model Context Protocol client runtime.
//!
//! Transports move frames, [`session::Session`] speaks the protocol over one
//! transport, [`registry::ClientRegistry`] pools sessions by descriptor
//! fingerprint, and [`service::McpService`] is the surface host
//! applications call.

pub mod builtin;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod oauth;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
