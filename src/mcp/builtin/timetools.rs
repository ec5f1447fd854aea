use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{text_result, BuiltinError, BuiltinServer};

pub const TIMETOOLS_SERVER: &str = "@toolrelay/timetools";
pub const GET_CURRENT_TIME_TOOL: &str = "get_current_time";

/// Reports the current system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeToolsServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeFormat {
    Full,
    Date,
    Time,
    Iso,
}

impl TimeFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("date") => TimeFormat::Date,
            Some("time") => TimeFormat::Time,
            Some("iso") => TimeFormat::Iso,
            _ => TimeFormat::Full,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TimeFormat::Full => "full",
            TimeFormat::Date => "date",
            TimeFormat::Time => "time",
            TimeFormat::Iso => "iso",
        }
    }
}

fn render<Tz: TimeZone>(time: &DateTime<Tz>, format: TimeFormat) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match format {
        TimeFormat::Full => time.format("%A, %B %-d, %Y %H:%M:%S %:z").to_string(),
        TimeFormat::Date => time.format("%A, %B %-d, %Y").to_string(),
        TimeFormat::Time => time.format("%H:%M:%S %:z").to_string(),
        TimeFormat::Iso => time.to_rfc3339(),
    }
}

/// Parse `+HH:MM`, `-HH:MM` or `+HHMM`.
fn parse_offset(zone: &str) -> Option<FixedOffset> {
    let (sign, rest) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|ch| *ch != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Format `now` for the requested zone: `UTC`, a fixed offset such as
/// `+08:00`, or the local zone when absent.
fn current_time(
    now: DateTime<Utc>,
    format: TimeFormat,
    timezone: Option<&str>,
) -> Result<(String, String), String> {
    match timezone.map(str::trim).filter(|zone| !zone.is_empty()) {
        None => Ok((render(&now.with_timezone(&Local), format), "local".to_string())),
        Some(zone) if zone.eq_ignore_ascii_case("utc") || zone == "Z" => {
            Ok((render(&now, format), "UTC".to_string()))
        }
        Some(zone) => {
            let offset =
                parse_offset(zone).ok_or_else(|| format!("Unsupported timezone: {zone}"))?;
            Ok((render(&now.with_timezone(&offset), format), zone.to_string()))
        }
    }
}

#[async_trait]
impl BuiltinServer for TimeToolsServer {
    fn server_info(&self) -> Value {
        json!({ "name": "time-tools-server", "version": "1.0.0" })
    }

    fn tools(&self) -> Vec<Value> {
        vec![json!({
            "name": GET_CURRENT_TIME_TOOL,
            "description": "Get the current system time with formatted date and time information",
            "inputSchema": {
                "type": "object",
                "required": [],
                "properties": {
                    "format": {
                        "type": "string",
                        "description": "Output format: full, date, time or iso. Defaults to full.",
                        "enum": ["full", "date", "time", "iso"]
                    },
                    "timezone": {
                        "type": "string",
                        "description": "UTC or a fixed offset such as +08:00. Defaults to the local zone."
                    }
                }
            }
        })]
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, BuiltinError> {
        if name != GET_CURRENT_TIME_TOOL {
            return Ok(text_result(format!("Unknown tool: {name}"), true));
        }
        let format = TimeFormat::parse(arguments.get("format").and_then(Value::as_str));
        let timezone = arguments.get("timezone").and_then(Value::as_str);
        info!(format = format.as_str(), timezone = ?timezone, "Handling get_current_time");

        let now = Utc::now();
        let (current, zone) = match current_time(now, format, timezone) {
            Ok(rendered) => rendered,
            Err(message) => return Ok(text_result(message, true)),
        };
        let payload = json!({
            "currentTime": current,
            "timestamp": now.timestamp_millis(),
            "timezone": zone,
            "format": format.as_str(),
        });
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|err| BuiltinError::internal(err.to_string()))?;
        Ok(text_result(text, false))
    }
}
