pub mod builtin_oauth;
pub mod cache;
pub mod config;
pub mod mcp_auth;
pub mod oauth;
