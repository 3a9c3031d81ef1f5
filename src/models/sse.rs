use tracing::trace;

use crate::error::{Error, Result};

/// One `event:`/`data:` pair from a server-sent-events body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE framing over a streaming HTTP response.
///
/// Bytes are buffered until a full line is available so multi-byte characters
/// split across network chunks decode correctly.
pub struct SseReader {
    response: reqwest::Response,
    decoder: SseDecoder,
    finished: bool,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::default(),
            finished: false,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.decoder.next_event(self.finished)? {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }

            match self.response.chunk().await {
                Ok(Some(chunk)) => self.decoder.push(&chunk),
                Ok(None) => self.finished = true,
                Err(e) => return Err(Error::model_provider(format!("Stream read error: {}", e))),
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emits the next complete event. With `eof` set, a trailing unterminated
    /// line and any pending data are flushed.
    pub(crate) fn next_event(&mut self, eof: bool) -> Result<Option<SseEvent>> {
        loop {
            let line = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                    decode_line(&raw[..raw.len() - 1])?
                }
                None if eof && !self.buffer.is_empty() => {
                    let raw = std::mem::take(&mut self.buffer);
                    decode_line(&raw)?
                }
                None if eof => return Ok(self.flush()),
                None => return Ok(None),
            };

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    return Ok(Some(event));
                }
                continue;
            }

            // Comment lines keep connections alive
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                other => trace!("Ignoring SSE field: {}", other),
            }
        }
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

fn decode_line(raw: &[u8]) -> Result<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::model_provider(format!("Invalid UTF-8 in stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder, eof: bool) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event(eof).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_data_only_events() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: first\n\ndata: second\n\n");

        let events = drain(&mut decoder, false);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[0].event, None);
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_named_events_and_comments() {
        let mut decoder = SseDecoder::default();
        decoder.push(b": ping\r\nevent: content_block_delta\r\ndata: {\"x\":1}\r\n\r\n");

        let events = drain(&mut decoder, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_partial_lines_wait_for_more_bytes() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: hel");
        assert!(decoder.next_event(false).unwrap().is_none());

        decoder.push(b"lo\n\n");
        let event = decoder.next_event(false).unwrap().unwrap();
        assert_eq!(event.data, "hello");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        decoder.push(&text[..split]);
        assert!(decoder.next_event(false).unwrap().is_none());
        decoder.push(&text[split..]);

        let event = decoder.next_event(false).unwrap().unwrap();
        assert_eq!(event.data, "héllo");
    }

    #[test]
    fn test_eof_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: [DONE]");

        assert!(decoder.next_event(false).unwrap().is_none());
        let events = drain(&mut decoder, true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }
}
