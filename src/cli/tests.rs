use super::*;
use crate::cli::server_list::ServerSummary;
use std::fs;
use tempfile::TempDir;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

fn sample_config() -> Config {
    toml::from_str(
        r#"
        [[mcp_servers]]
        id = "time"
        name = "Time"
        kind = "in-process"
        command = "@toolrelay/timetools"

        [[mcp_servers]]
        id = "remote"
        name = "Remote"
        base_url = "https://mcp.example.com/mcp"
        enabled = false
        "#,
    )
    .expect("config parses")
}

#[test]
fn test_call_arguments_parsing() {
    let args = parse_args(&[
        "toolrelay",
        "call",
        "time",
        "get_current_time",
        "--args",
        r#"{"format": "iso"}"#,
    ]);
    match args.command {
        Commands::Call { server, tool, args } => {
            assert_eq!(server, "time");
            assert_eq!(tool, "get_current_time");
            assert_eq!(args.expect("arguments")["format"], "iso");
        }
        _ => panic!("expected call subcommand"),
    }

    assert!(Args::try_parse_from(["toolrelay", "call", "time", "x", "--args", "[1]"]).is_err());
    assert!(Args::try_parse_from(["toolrelay", "call", "time", "x", "--args", "{"]).is_err());
}

#[test]
fn test_prompt_arguments_parsing() {
    let args = parse_args(&[
        "toolrelay",
        "prompt",
        "docs",
        "greet",
        "--arg",
        "name=Ada",
        "--arg",
        "tone=warm=ish",
    ]);
    match args.command {
        Commands::Prompt {
            server,
            name,
            arguments,
        } => {
            assert_eq!(server, "docs");
            assert_eq!(name, "greet");
            assert_eq!(
                arguments,
                vec![
                    ("name".to_string(), "Ada".to_string()),
                    ("tone".to_string(), "warm=ish".to_string()),
                ]
            );
        }
        _ => panic!("expected prompt subcommand"),
    }
    assert!(parse_key_value("novalue").is_err());
    assert!(parse_key_value("=value").is_err());
}

#[test]
fn test_global_flags() {
    let args = parse_args(&["toolrelay", "-v", "tools", "time", "--config", "/tmp/c.toml"]);
    assert!(args.verbose);
    assert_eq!(args.config, Some(PathBuf::from("/tmp/c.toml")));
    assert!(matches!(args.command, Commands::Tools { ref server } if server == "time"));

    let args = parse_args(&["toolrelay", "install-info"]);
    assert!(!args.verbose);
    assert!(matches!(args.command, Commands::InstallInfo));
}

#[test]
fn test_resolve_server_refuses_unknown_and_disabled() {
    let config = sample_config();
    assert_eq!(resolve_server(&config, "TIME").expect("time").id, "time");
    assert_eq!(
        resolve_server(&config, "remote").expect_err("disabled"),
        "MCP server 'remote' is disabled"
    );
    assert_eq!(
        resolve_server(&config, "nope").expect_err("unknown"),
        "Unknown MCP server: nope"
    );
}

#[test]
fn test_load_config_from_explicit_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "request_timeout_seconds = 5\n[[mcp_servers]]\nid = \"a\"\nname = \"A\"\ncommand = \"node\"\n",
    )
    .expect("write config");

    let config = load_config(Some(path)).expect("load");
    assert_eq!(config.mcp_servers.len(), 1);
    assert_eq!(config.request_timeout().as_secs(), 5);

    let missing = load_config(Some(dir.path().join("absent.toml"))).expect("defaults");
    assert!(missing.mcp_servers.is_empty());
}

#[test]
fn test_server_summaries() {
    let config = sample_config();
    let summaries: Vec<_> = config
        .mcp_servers
        .iter()
        .map(ServerSummary::from_descriptor)
        .collect();
    assert_eq!(summaries[0].transport, "in-process");
    assert!(summaries[0].enabled);
    assert_eq!(summaries[1].transport, "streamable-http");
    assert!(!summaries[1].enabled);
    assert_eq!(summaries[0].fingerprint.len(), 64);
}

#[tokio::test]
async fn test_builtin_server_end_to_end() {
    let config = sample_config();
    let service =
        McpService::new(&config, McpTokenStore::new_with_keyring(false)).expect("service");
    let server = resolve_server(&config, "time").expect("server");

    let tools = service.list_tools(&server).await.expect("tools");
    assert_eq!(tools[0].tool_key, "time-get_current_time");

    let mut arguments = Map::new();
    arguments.insert("timezone".to_string(), Value::from("UTC"));
    let response = service
        .call_tool(&server, "get_current_time", arguments)
        .await
        .expect("call");
    assert!(!response.is_error);
    service.cleanup().await;
}
