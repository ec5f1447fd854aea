use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::core::config::ServerDescriptor;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFields<'a> {
    base_url: Option<&'a str>,
    command: Option<&'a str>,
    args: &'a [String],
    registry_url: Option<&'a str>,
    env: BTreeMap<&'a str, &'a str>,
    id: &'a str,
}

/// Pooling identity for a descriptor.
///
/// SHA-256 over the canonical JSON of the fields that decide which process
/// or endpoint a session talks to. Display name, headers, transport kind,
/// and timeouts do not participate. Absent and empty collections hash the
/// same.
pub fn fingerprint(descriptor: &ServerDescriptor) -> String {
    let env = descriptor
        .env
        .iter()
        .flatten()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    let fields = IdentityFields {
        base_url: descriptor.base_url.as_deref(),
        command: descriptor.command.as_deref(),
        args: descriptor.args(),
        registry_url: descriptor.registry_url.as_deref(),
        env,
        id: &descriptor.id,
    };
    // Serializing borrowed strings and a BTreeMap cannot fail.
    let canonical = serde_json::to_vec(&fields).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}
