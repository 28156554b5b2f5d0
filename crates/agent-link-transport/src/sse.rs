//! Server-Sent Events decoding.
//!
//! Handles line buffering across chunk boundaries, `event:`/`data:` fields,
//! multi-line data, comments and the `[DONE]` marker.

use std::collections::VecDeque;

use agent_link_core::{
    TransportError,
    traits::{EventStream, ServerSentEvent},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerSentEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            match std::str::from_utf8(&line) {
                Ok(line) => events.extend(self.feed_line(line)),
                Err(_) => tracing::warn!("skipping non-UTF-8 SSE line"),
            }
        }
        events
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&rest) {
                let line = line.trim_end_matches('\r');
                if let Some(event) = self.feed_line(line) {
                    return Some(event);
                }
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<ServerSentEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').map_or((line, ""), |(field, value)| {
            (field, value.strip_prefix(' ').unwrap_or(value))
        });
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<ServerSentEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        if data.trim() == "[DONE]" {
            return None;
        }
        Some(ServerSentEvent { event, data })
    }
}

/// Turn a response body into a stream of server-sent events.
///
/// A read error ends the stream after yielding it.
pub fn event_stream<S, E>(body: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (body.boxed(), SseDecoder::new(), VecDeque::new(), false);
    futures::stream::unfold(state, |(mut body, mut decoder, mut queue, mut ended)| async move {
        loop {
            if let Some(event) = queue.pop_front() {
                return Some((Ok(event), (body, decoder, queue, ended)));
            }
            if ended {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => queue.extend(decoder.push(&chunk)),
                Some(Err(e)) => {
                    tracing::warn!("SSE stream read error: {e}");
                    let err = TransportError::Interrupted(e.to_string());
                    return Some((Err(err), (body, decoder, queue, true)));
                }
                None => {
                    ended = true;
                    queue.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: connected\ndata: {\"sessionId\":\"s1\"}\n\n");
        assert_eq!(
            events,
            vec![ServerSentEvent {
                event: Some("connected".into()),
                data: "{\"sessionId\":\"s1\"}".into(),
            }]
        );
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"mess").is_empty());
        assert!(decoder.push(b"age\":\"Hel\"}\r\n").is_empty());
        let events = decoder.push(b"\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"message\":\"Hel\"}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_done_marker_skipped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]\n\n").is_empty());
    }

    #[test]
    fn test_event_name_resets_between_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: error\ndata: {}\n\ndata: {}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("error"));
        assert_eq!(events[1].event, None);
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"done\":true}").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "{\"done\":true}");
    }

    #[tokio::test]
    async fn test_event_stream_over_chunks() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"event: connected\ndata: {}\n\nda")),
            Ok(Bytes::from_static(b"ta: {\"message\":\"x\"}\n\n")),
        ];
        let events: Vec<_> = event_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().event.as_deref(), Some("connected"));
        assert_eq!(events[1].as_ref().unwrap().data, "{\"message\":\"x\"}");
    }

    #[tokio::test]
    async fn test_event_stream_read_error_ends_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {}\n\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"data: {}\n\n")),
        ];
        let events: Vec<_> = event_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(TransportError::Interrupted(_))));
    }
}
