//! Decoder for the assistant's newline-delimited JSON response stream.
//!
//! Every line of the body is an independent JSON object
//! `{"type": "text" | "chat_id" | ..., "content": ...}`. Network chunks are
//! not aligned with lines, so the decoder carries the unterminated tail of
//! one chunk over to the next and only parses complete lines.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// One decoded unit of the response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text to append to the assistant message being assembled.
    TextDelta { text: String },
    /// Backend-issued id for a conversation created by this send.
    ChatAssigned { id: String },
    /// Well-formed line with a discriminant this client does not handle.
    Unknown { kind: String },
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

fn parse_error(message: impl Into<String>, line: &[u8]) -> EngineError {
    EngineError::Parse {
        message: message.into(),
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

/// Parse a single line (without its terminator).
///
/// Blank lines yield `Ok(None)`.
pub fn parse_event_line(line: &[u8]) -> EngineResult<Option<StreamEvent>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let wire: WireEvent =
        serde_json::from_slice(line).map_err(|e| parse_error(e.to_string(), line))?;

    let event = match wire.kind.as_str() {
        "text" => match wire.content {
            Some(serde_json::Value::String(text)) => StreamEvent::TextDelta { text },
            _ => return Err(parse_error("text event without string content", line)),
        },
        "chat_id" => match wire.content {
            Some(serde_json::Value::String(id)) if !id.is_empty() => StreamEvent::ChatAssigned { id },
            Some(serde_json::Value::Number(n)) => StreamEvent::ChatAssigned { id: n.to_string() },
            _ => return Err(parse_error("chat_id event without an id", line)),
        },
        _ => StreamEvent::Unknown { kind: wire.kind },
    };
    Ok(Some(event))
}

/// Incremental line splitter and parser for one response stream.
///
/// Not restartable: `finish` consumes the decoder.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    line_buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and return the events of every line it completed.
    ///
    /// Malformed lines are logged and skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.line_buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline_index) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=newline_index).collect();
            if let Some(event) = Self::decode_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.line_buffer.len()
    }

    /// End of input: a trailing line without terminator is parsed as the last line.
    pub fn finish(self) -> Option<StreamEvent> {
        if self.line_buffer.is_empty() {
            return None;
        }
        debug!(bytes = self.line_buffer.len(), "Decoding unterminated final line");
        Self::decode_line(&self.line_buffer)
    }

    fn decode_line(line: &[u8]) -> Option<StreamEvent> {
        match parse_event_line(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "Skipping malformed stream line");
                None
            }
        }
    }
}

/// Decode a byte stream into an ordered stream of events.
///
/// The output ends when the input ends. A transport error, or a read that
/// stalls longer than `idle_timeout`, is yielded once and ends the output;
/// any partial line held at that point is dropped.
pub fn decode_stream<S>(
    bytes: S,
    idle_timeout: Option<Duration>,
) -> BoxStream<'static, EngineResult<StreamEvent>>
where
    S: Stream<Item = EngineResult<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = StreamDecoder::new();

        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, bytes.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        warn!(timeout_secs = limit.as_secs(), "Response stream went idle");
                        yield Err(EngineError::network("stream idle timeout"));
                        return;
                    }
                },
                None => bytes.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        yield Ok(event);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, pending = decoder.pending_len(), "Response stream failed");
                    yield Err(e);
                    return;
                }
                None => break,
            }
        }

        if let Some(event) = decoder.finish() {
            yield Ok(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> StreamEvent {
        StreamEvent::TextDelta { text: s.to_string() }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = EngineResult<Bytes>> + Send + 'static {
        let owned: Vec<EngineResult<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    async fn collect(stream: BoxStream<'static, EngineResult<StreamEvent>>) -> Vec<EngineResult<StreamEvent>> {
        stream.collect().await
    }

    #[test]
    fn test_parse_known_events() {
        assert_eq!(
            parse_event_line(br#"{"type":"text","content":"Hel"}"#).unwrap(),
            Some(text("Hel"))
        );
        assert_eq!(
            parse_event_line(br#"{"type":"chat_id","content":"42"}"#).unwrap(),
            Some(StreamEvent::ChatAssigned { id: "42".into() })
        );
        assert_eq!(
            parse_event_line(br#"{"type":"chat_id","content":42}"#).unwrap(),
            Some(StreamEvent::ChatAssigned { id: "42".into() })
        );
    }

    #[test]
    fn test_parse_unknown_and_blank() {
        assert_eq!(
            parse_event_line(br#"{"type":"usage","content":{"tokens":3}}"#).unwrap(),
            Some(StreamEvent::Unknown { kind: "usage".into() })
        );
        assert_eq!(parse_event_line(b"   ").unwrap(), None);
        assert_eq!(parse_event_line(b"\r").unwrap(), None);
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(parse_event_line(b"{oops"), Err(EngineError::Parse { .. })));
        assert!(matches!(
            parse_event_line(br#"{"content":"no type"}"#),
            Err(EngineError::Parse { .. })
        ));
        assert!(matches!(
            parse_event_line(br#"{"type":"text"}"#),
            Err(EngineError::Parse { .. })
        ));
    }

    #[test]
    fn test_crlf_lines() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(b"{\"type\":\"text\",\"content\":\"a\"}\r\n");
        assert_eq!(events, vec![text("a")]);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut decoder = StreamDecoder::new();

        let first = decoder.push(br#"{"type":"text","content":"Hel"}
{"ty"#);
        assert_eq!(first, vec![text("Hel")]);
        assert_eq!(decoder.pending_len(), 4);

        let second = decoder.push(
            br#"pe":"text","content":"lo"}
{"type":"chat_id","content":"42"}
"#,
        );
        assert_eq!(
            second,
            vec![text("lo"), StreamEvent::ChatAssigned { id: "42".into() }]
        );
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let line = "{\"type\":\"text\",\"content\":\"caf\u{e9}\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xc3).unwrap() + 1;

        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![text("caf\u{e9}")]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(
            b"{\"type\":\"text\",\"content\":\"a\"}\nnot json at all\n{\"type\":\"text\",\"content\":\"b\"}\n",
        );
        assert_eq!(events, vec![text("a"), text("b")]);
    }

    #[test]
    fn test_finish_parses_unterminated_tail() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(br#"{"type":"text","content":"end"}"#).is_empty());
        assert_eq!(decoder.finish(), Some(text("end")));
    }

    #[tokio::test]
    async fn test_decode_stream_preserves_order() {
        let stream = decode_stream(
            chunks(&[
                "{\"type\":\"text\",\"content\":\"Hel\"}\n{\"ty",
                "pe\":\"text\",\"content\":\"lo\"}\n{\"type\":\"chat_id\",\"content\":\"42\"}\n",
            ]),
            None,
        );

        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                text("Hel"),
                text("lo"),
                StreamEvent::ChatAssigned { id: "42".into() }
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_ends_after_transport_error() {
        let items: Vec<EngineResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"text\",\"content\":\"a\"}\n{\"type\":\"te")),
            Err(EngineError::network("connection reset")),
            Ok(Bytes::from_static(b"{\"type\":\"text\",\"content\":\"never\"}\n")),
        ];
        let results = collect(decode_stream(futures::stream::iter(items), None)).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Ok(text("a")));
        assert!(matches!(results[1], Err(EngineError::Network { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_stream_idle_timeout() {
        let stalled = futures::stream::iter(vec![Ok(Bytes::from_static(
            b"{\"type\":\"text\",\"content\":\"a\"}\n",
        ))])
        .chain(futures::stream::pending());

        let results = collect(decode_stream(stalled, Some(Duration::from_secs(5)))).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Ok(text("a")));
        assert_eq!(results[1], Err(EngineError::network("stream idle timeout")));
    }
}
