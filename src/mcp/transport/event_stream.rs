//! `text/event-stream` decoding for the HTTP transports.

use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::decode_frame;

/// Splits a byte stream into trimmed, non-empty text lines. Bytes after the
/// last newline are held until more arrive or [`LineSplitter::flush`].
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            push_text_line(&mut lines, &line);
        }
        lines
    }

    pub fn flush(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        let mut lines = Vec::new();
        push_text_line(&mut lines, &rest);
        lines
    }
}

fn push_text_line(lines: &mut Vec<String>, raw: &[u8]) {
    // Invalid UTF-8 lines are dropped rather than failing the stream.
    if let Ok(text) = std::str::from_utf8(raw) {
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
}

pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case(super::http::EVENT_STREAM))
}

/// One dispatched event: the `data:` payload and the `event:` name that
/// preceded it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Pairs `event:` fields with the `data:` field that follows. Comments and
/// other fields are ignored.
#[derive(Debug, Default)]
pub struct EventAssembler {
    name: Option<String>,
}

impl EventAssembler {
    pub fn accept(&mut self, line: &str) -> Option<SseEvent> {
        let (field, value) = line.split_once(':')?;
        let value = value.trim();
        match field {
            "event" => {
                self.name = Some(value.to_string());
                None
            }
            "data" => {
                let event = self.name.take();
                (!value.is_empty()).then(|| SseEvent {
                    event,
                    data: value.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Read an event stream to its end, handing every event to `on_event`.
/// Returns early when `cancel` fires.
pub async fn pump_event_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
    mut on_event: impl FnMut(SseEvent),
) -> Result<(), reqwest::Error> {
    let mut body = response.bytes_stream();
    let mut splitter = LineSplitter::default();
    let mut assembler = EventAssembler::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = body.next() => next,
        };
        let lines = match next {
            Some(chunk) => splitter.feed(&chunk?),
            None => break,
        };
        lines
            .iter()
            .filter_map(|line| assembler.accept(line))
            .for_each(&mut on_event);
    }
    splitter
        .flush()
        .iter()
        .filter_map(|line| assembler.accept(line))
        .for_each(on_event);
    Ok(())
}

/// Queue the server messages carried by an event's data.
pub(crate) fn forward_event_messages(
    server_id: &str,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    event: SseEvent,
) {
    match decode_frame(&event.data) {
        Ok(messages) => {
            for message in messages {
                let _ = tx.send(message);
            }
        }
        Err(err) => {
            debug!(server_id = %server_id, error = %err, "Ignoring undecodable MCP event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_holds_partial_lines() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.feed(b"data: one").is_empty());
        assert_eq!(splitter.feed(b"\n\n"), vec!["data: one"]);
        assert!(splitter.feed(b"data: t").is_empty());
        assert_eq!(splitter.feed(b"wo\r\nda"), vec!["data: two"]);
        assert_eq!(splitter.flush(), vec!["da"]);
        assert!(splitter.flush().is_empty());
    }

    #[test]
    fn event_stream_media_type_is_case_insensitive() {
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(is_event_stream(Some("Text/Event-Stream")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }

    #[test]
    fn assembler_pairs_event_names_with_data() {
        let mut assembler = EventAssembler::default();
        assert_eq!(assembler.accept("event: endpoint"), None);
        assert_eq!(
            assembler.accept("data: /messages?sessionId=abc"),
            Some(SseEvent {
                event: Some("endpoint".to_string()),
                data: "/messages?sessionId=abc".to_string(),
            })
        );
        assert_eq!(
            assembler.accept("data: {\"jsonrpc\":\"2.0\"}"),
            Some(SseEvent {
                event: None,
                data: "{\"jsonrpc\":\"2.0\"}".to_string(),
            })
        );
        assert_eq!(assembler.accept(": keep-alive"), None);
        assert_eq!(assembler.accept("id: 7"), None);
        assert_eq!(assembler.accept("data:"), None);
    }

    #[test]
    fn undecodable_events_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_event_messages(
            "remote",
            &tx,
            SseEvent {
                event: None,
                data: "not json".to_string(),
            },
        );
        forward_event_messages(
            "remote",
            &tx,
            SseEvent {
                event: None,
                data: r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#
                    .to_string(),
            },
        );
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
