//! toolrelay is a client runtime for Model Context Protocol servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the four transports, protocol sessions, the pooled client
//!   registry, the OAuth callback coordinator, built-in in-process servers,
//!   and the [`mcp::service::McpService`] operation surface.
//! - [`core`] holds configuration, the TTL cache, and OAuth token storage
//!   backed by the platform keyring.
//! - [`cli`] is a thin command-line host that prints operation results as
//!   JSON.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod mcp;
