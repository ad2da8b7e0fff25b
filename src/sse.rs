//! Server-Sent Events and NDJSON framing.
//!
//! Providers stream either SSE:
//! ```text
//! event: content_block_delta
//! data: {"key": "value"}
//!
//! data: [DONE]
//! ```
//! or one bare JSON object per line. Both come out of [`LineDecoder`] as data
//! payloads; `event:`, `id:`, `retry:` and comment lines are dropped.

use futures::stream::{self, Stream, StreamExt};

use crate::client::ClientError;

/// Incremental splitter from raw body bytes to data payloads.
///
/// Bytes are buffered until a full line arrives, so multi-byte UTF-8
/// characters split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` was seen. Later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk, returning the payloads of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.take_line(&line, &mut payloads) {
                break;
            }
        }
        payloads
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.take_line(&line, &mut payloads);
        }
        payloads
    }

    /// Returns true when the done marker was reached.
    fn take_line(&mut self, raw: &[u8], payloads: &mut Vec<String>) -> bool {
        let line = String::from_utf8_lossy(raw);
        if let Some(data) = parse_sse_line(line.trim()) {
            if is_done_marker(data) {
                self.done = true;
                self.buffer.clear();
                return true;
            }
            payloads.push(data.to_string());
        }
        false
    }
}

/// Extension trait for `reqwest::Response` to enable SSE streaming.
pub trait SSEResponseExt {
    /// Convert the response into a stream of data payloads.
    ///
    /// Stops when `[DONE]` is encountered or the body ends.
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send {
        let byte_stream = self.bytes_stream();

        stream::unfold(
            (Box::pin(byte_stream), LineDecoder::new(), false),
            |(mut byte_stream, mut decoder, ended)| async move {
                if ended || decoder.is_done() {
                    return None;
                }
                let items: Vec<Result<String, ClientError>> = match byte_stream.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk).into_iter().map(Ok).collect(),
                    Some(Err(e)) => vec![Err(ClientError::from(e))],
                    None => {
                        let tail = decoder.finish().into_iter().map(Ok).collect();
                        return Some((tail, (byte_stream, decoder, true)));
                    }
                };
                let failed = items.iter().any(|item| item.is_err());
                Some((items, (byte_stream, decoder, failed)))
            },
        )
        .flat_map(stream::iter)
    }
}

/// Extract the payload of an SSE or NDJSON line.
///
/// # Example
/// ```
/// use chatrelay::sse::parse_sse_line;
///
/// assert_eq!(parse_sse_line("data: {\"key\": 1}"), Some("{\"key\": 1}"));
/// assert_eq!(parse_sse_line("{\"key\": 1}"), Some("{\"key\": 1}"));
/// assert_eq!(parse_sse_line("event: ping"), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    if let Some(data) = line.strip_prefix("data:") {
        return Some(data.trim()).filter(|d| !d.is_empty());
    }
    if line.starts_with('{') || line.starts_with('[') {
        return Some(line);
    }
    None
}

/// Check if a data payload indicates the stream is done.
pub fn is_done_marker(data: &str) -> bool {
    data == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(parse_sse_line("data: hello"), Some("hello"));
        assert_eq!(parse_sse_line("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_line("data:   spaces  "), Some("spaces"));
        assert_eq!(parse_sse_line("data:"), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("id: 7"), None);
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn test_is_done_marker() {
        assert!(is_done_marker("[DONE]"));
        assert!(!is_done_marker(""));
        assert!(!is_done_marker("{\"key\": \"value\"}"));
    }

    #[test]
    fn test_decoder_splits_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\n\ndata: {\"b\":2}\n"), vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_decoder_keeps_split_utf8() {
        let line = "data: {\"t\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec!["{\"t\":\"héllo\"}"]);
    }

    #[test]
    fn test_decoder_stops_at_done() {
        let mut decoder = LineDecoder::new();
        let payloads = decoder.push(b"data: 1\ndata: [DONE]\ndata: 2\n");
        assert_eq!(payloads, vec!["1"]);
        assert!(decoder.is_done());
        assert!(decoder.push(b"data: 3\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_ndjson_and_tail() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"{\"a\":1}\r\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(decoder.push(b":2}"), Vec::<String>::new());
        assert_eq!(decoder.finish(), vec!["{\"b\":2}"]);
    }
}
