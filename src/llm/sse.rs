//! Server-sent-event frame decoding.
//!
//! Frames are runs of `field: value` lines terminated by a blank line:
//! ```text
//! event: content_block_delta
//! data: {"type": "content_block_delta", ...}
//!
//! ```
//! Multi-line `data:` fields are joined with `\n`; comment lines and unknown
//! fields are ignored.

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{RelayError, Result};

/// Raw body bytes as delivered by the transport
pub type ByteSource = BoxStream<'static, Result<Vec<u8>>>;

/// Adapt a reqwest response body into a [`ByteSource`]
pub fn response_source(response: reqwest::Response) -> ByteSource {
    response
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(RelayError::from))
        .boxed()
}

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder pulling bytes from a [`ByteSource`]
pub struct SseDecoder {
    source: ByteSource,
    buffer: Vec<u8>,
    exhausted: bool,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new(source: ByteSource) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            exhausted: false,
            event: None,
            data: Vec::new(),
        }
    }

    /// Next complete frame, or `None` once the transport is exhausted.
    ///
    /// A frame left unterminated at end of transport is discarded.
    pub async fn next_frame(&mut self) -> Result<Option<SseFrame>> {
        loop {
            while let Some(line) = self.take_line()? {
                if let Some(frame) = self.feed_line(&line) {
                    return Ok(Some(frame));
                }
            }

            if self.exhausted {
                if !self.buffer.is_empty() || !self.data.is_empty() {
                    log::debug!("discarding unterminated SSE frame at end of transport");
                    self.buffer.clear();
                    self.data.clear();
                    self.event = None;
                }
                return Ok(None);
            }

            match self.source.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| RelayError::Protocol(format!("invalid UTF-8 in event stream: {}", e)))
    }

    /// Feed one line (without terminator); returns a frame on a blank line
    pub fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let frame = SseFrame {
                event: self.event.take(),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(frame);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}
