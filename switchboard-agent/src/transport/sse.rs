// ABOUTME: Incremental server-sent-events decoder with a carry-over buffer for partial lines.
// ABOUTME: Yields the JSON payload of each `data:` line; undecodable payloads are skipped.

use serde_json::Value;

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes are buffered until a newline arrives, so chunks may split a line (or
/// a multi-byte character) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every complete JSON payload it finished
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(value) = decode_line(&line) {
                payloads.push(value);
            }
        }
        payloads
    }

    /// Bytes held back waiting for the rest of a line
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<Value> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::trace!(error = %e, "Skipping undecodable SSE payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_complete_frames() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(
            b"data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_1\"}}\n\n",
        );
        assert_eq!(
            out,
            vec![json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}})]
        );
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_carries_partial_lines_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"ses").is_empty());
        assert!(decoder.pending_bytes() > 0);
        let out = decoder.push(b"sion.idle\"}\n\ndata: {\"a\":1}\n");
        assert_eq!(out, vec![json!({"type": "session.idle"}), json!({"a": 1})]);
    }

    #[test]
    fn test_split_multibyte_character() {
        let frame = "data: {\"text\":\"héllo\"}\n".as_bytes();
        let split = frame.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&frame[..split]).is_empty());
        assert_eq!(decoder.push(&frame[split..]), vec![json!({"text": "héllo"})]);
    }

    #[test]
    fn test_skips_non_data_and_garbage() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(b": keepalive\nevent: message\ndata: [DONE]\ndata: {broken\r\ndata:{\"ok\":true}\r\n");
        assert_eq!(out, vec![json!({"ok": true})]);
    }
}
