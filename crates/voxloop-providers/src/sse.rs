//! Server-Sent Events framing for streamed chat completions.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct Framer<S> {
    bytes: S,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    done: bool,
}

impl<S> Framer<S> {
    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }

    /// Consume one complete line from the buffer. Returns an event when the
    /// line was the blank separator ending one.
    fn next_line(&mut self) -> Option<Option<SseEvent>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        // Only whole lines are decoded, so multi-byte characters split
        // across chunks arrive intact.
        let decoded = String::from_utf8_lossy(&raw[..pos]);
        let line = decoded.trim_end_matches('\r');

        if line.is_empty() {
            return Some(self.take_event());
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        }
        // Comments (":") and unknown fields are ignored.
        Some(None)
    }
}

/// Split a byte stream into SSE events.
pub fn parse_sse<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let framer = Framer {
        bytes,
        buffer: Vec::new(),
        event: None,
        data: Vec::new(),
        done: false,
    };

    futures::stream::unfold(framer, |mut f| async move {
        loop {
            match f.next_line() {
                Some(Some(event)) => return Some((Ok(event), f)),
                Some(None) => continue,
                None if f.done => return f.take_event().map(|event| (Ok(event), f)),
                None => {}
            }

            match f.bytes.next().await {
                Some(Ok(chunk)) => f.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), f)),
                None => {
                    // Flush a final line that was not newline-terminated.
                    f.done = true;
                    if !f.buffer.is_empty() {
                        f.buffer.push(b'\n');
                    }
                }
            }
        }
    })
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    let bytes: ByteStream = Box::pin(response.bytes_stream());
    parse_sse(bytes)
}
