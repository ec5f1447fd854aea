//! Command-line interface parsing and handling
//!
//! Each subcommand runs one operation against one configured server and
//! prints the result as JSON on stdout. Logs go to stderr.

pub mod server_list;

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::server_list::list_servers;
use crate::core::config::{Config, ServerDescriptor};
use crate::core::mcp_auth::McpTokenStore;
use crate::mcp::service::McpService;

#[derive(Parser)]
#[command(name = "toolrelay")]
#[command(about = "Discover and invoke tools, prompts and resources on MCP servers")]
#[command(
    long_about = "toolrelay connects to Model Context Protocol servers over stdio, SSE, \
streamable HTTP or an in-process channel, and runs one operation per invocation.\n\n\
Servers are read from [[mcp_servers]] entries in the config file. Output is JSON on \
stdout; logs are written to stderr (set RUST_LOG or pass -v for more detail).\n\n\
Remote servers that require OAuth open a browser window and wait for the callback on \
the configured loopback port."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to read instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured servers
    Servers,
    /// List the tools a server exposes
    Tools {
        /// Server id
        server: String,
    },
    /// Call a tool
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, value_name = "JSON", value_parser = parse_arguments)]
        args: Option<Map<String, Value>>,
    },
    /// List the prompts a server exposes
    Prompts { server: String },
    /// Fetch a prompt
    Prompt {
        server: String,
        name: String,
        /// Prompt argument, repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        arguments: Vec<(String, String)>,
    },
    /// List the resources a server exposes
    Resources { server: String },
    /// Read a resource
    Resource { server: String, uri: String },
    /// Show where helper binaries are expected
    InstallInfo,
}

pub(crate) fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn Error>> {
    let path = path
        .or_else(Config::default_config_path)
        .ok_or("Unable to determine config directory")?;
    Ok(Config::load_from_path(&path)?)
}

/// Look up an enabled server by id (case-insensitive).
pub(crate) fn resolve_server(config: &Config, id: &str) -> Result<ServerDescriptor, String> {
    let server = config
        .find_server(id)
        .ok_or_else(|| format!("Unknown MCP server: {id}"))?;
    if !server.is_enabled() {
        return Err(format!("MCP server '{}' is disabled", server.id));
    }
    Ok(server.clone())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = load_config(args.config)?;

    match args.command {
        Commands::Servers => list_servers(&config),
        Commands::InstallInfo => {
            let service = McpService::new(&config, McpTokenStore::new_with_keyring(false))?;
            print_json(&service.get_install_info())
        }
        command => {
            let token_store = McpTokenStore::new_with_keyring(config.oauth.use_keyring());
            let service = McpService::new(&config, token_store)?;
            let result = run_server_command(&service, &config, command).await;
            service.cleanup().await;
            result
        }
    }
}

async fn run_server_command(
    service: &McpService,
    config: &Config,
    command: Commands,
) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Tools { server } => {
            let server = resolve_server(config, &server)?;
            print_json(&service.list_tools(&server).await?)
        }
        Commands::Call { server, tool, args } => {
            let server = resolve_server(config, &server)?;
            let response = service
                .call_tool(&server, &tool, args.unwrap_or_default())
                .await?;
            print_json(&response)
        }
        Commands::Prompts { server } => {
            let server = resolve_server(config, &server)?;
            print_json(&service.list_prompts(&server).await?)
        }
        Commands::Prompt {
            server,
            name,
            arguments,
        } => {
            let server = resolve_server(config, &server)?;
            let arguments: Option<HashMap<String, String>> =
                (!arguments.is_empty()).then(|| arguments.into_iter().collect());
            print_json(&service.get_prompt(&server, &name, arguments).await?)
        }
        Commands::Resources { server } => {
            let server = resolve_server(config, &server)?;
            print_json(&service.list_resources(&server).await?)
        }
        Commands::Resource { server, uri } => {
            let server = resolve_server(config, &server)?;
            print_json(&service.get_resource(&server, &uri).await?)
        }
        Commands::Servers | Commands::InstallInfo => Ok(()),
    }
}

#[cfg(test)]
mod tests;
