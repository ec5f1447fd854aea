use std::error::Error;

use serde::Serialize;

use crate::core::config::{Config, ServerDescriptor};
use crate::mcp::fingerprint::fingerprint;
use crate::mcp::transport::McpTransportKind;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    /// Resolved transport, or the configuration error that prevents one.
    pub transport: String,
    pub enabled: bool,
    pub fingerprint: String,
}

impl ServerSummary {
    pub fn from_descriptor(server: &ServerDescriptor) -> Self {
        let transport = match McpTransportKind::from_descriptor(server) {
            Ok(kind) => kind.as_str().to_string(),
            Err(err) => err.to_string(),
        };
        Self {
            id: server.id.clone(),
            name: server.label().to_string(),
            transport,
            enabled: server.is_enabled(),
            fingerprint: fingerprint(server),
        }
    }
}

pub fn list_servers(config: &Config) -> Result<(), Box<dyn Error>> {
    let servers: Vec<ServerSummary> = config
        .mcp_servers
        .iter()
        .map(ServerSummary::from_descriptor)
        .collect();
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}
