//! Native-messaging transport: 4-byte little-endian length prefix + UTF-8
//! JSON body framing used to talk to the browser extension (spec §4.4).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::TransportError;
use crate::model::Message;

/// Reads complete frames from `reader`, one at a time. Malformed JSON is
/// logged and discarded without desynchronizing the stream; frames over
/// `max_frame_bytes` are discarded the same way (spec §4.4 limits).
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self { reader, max_frame_bytes }
    }

    /// Reads and decodes the next frame. Returns `Ok(None)` on clean EOF.
    /// A malformed or oversized frame is reported as `Err` but the stream
    /// remains usable for the next call.
    pub async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(TransportError::Io(e)),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > self.max_frame_bytes {
            // Still consume the frame so the stream doesn't desync.
            let mut sink = vec![0u8; len];
            self.reader.read_exact(&mut sink).await?;
            return Err(TransportError::FrameTooLarge {
                limit: self.max_frame_bytes,
                actual: len,
            });
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;

        match serde_json::from_slice::<Message>(&body) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!(error = %e, "malformed frame, discarding");
                Err(TransportError::Malformed(e))
            }
        }
    }
}

/// Writes frames to `writer`. Each `send` performs the length-prefix write
/// and body write back-to-back so two concurrent sends can never interleave
/// their bytes (callers should still serialize calls through a single
/// owner, per spec §5's single-writer discipline).
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)?;
        let len = (body.len() as u32).to_le_bytes();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&body);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Loops `next_message` until EOF, dispatching frames to `on_message` and
/// logging (not propagating) per-frame transport errors, per spec §4.4's
/// "surviving is a correctness requirement".
pub async fn run_read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    mut on_message: impl FnMut(Message),
) {
    loop {
        match reader.next_message().await {
            Ok(Some(message)) => on_message(message),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "transport error, continuing to read next frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn round_trips_a_ping_message() {
        let msg = Message::Ping { timestamp: 1 };
        let body = serde_json::to_vec(&msg).unwrap();
        let bytes = frame(&body);
        let mut reader = FrameReader::new(Cursor::new(bytes), 1024 * 1024);
        let decoded = reader.next_message().await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_desync_the_stream() {
        let malformed = frame(b"PING0");
        let mut valid = frame(br#"{"type":"PING","timestamp":1}"#);
        let mut bytes = malformed;
        bytes.append(&mut valid);

        let mut reader = FrameReader::new(Cursor::new(bytes), 1024 * 1024);
        let first = reader.next_message().await;
        assert!(first.is_err());

        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second, Message::Ping { timestamp: 1 });
    }

    #[tokio::test]
    async fn oversized_frame_is_reported_and_skipped() {
        let mut bytes = (10u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"0123456789");
        let mut valid = frame(br#"{"type":"PING","timestamp":2}"#);
        bytes.append(&mut valid);

        let mut reader = FrameReader::new(Cursor::new(bytes), 4);
        let first = reader.next_message().await;
        assert!(matches!(first, Err(TransportError::FrameTooLarge { .. })));

        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second, Message::Ping { timestamp: 2 });
    }

    #[tokio::test]
    async fn send_then_read_round_trips() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer
                .send(&Message::Pong {
                    timestamp: 5,
                    version: "0.1.0".to_string(),
                })
                .await
                .unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(buf), 1024 * 1024);
        let decoded = reader.next_message().await.unwrap().unwrap();
        assert_eq!(
            decoded,
            Message::Pong {
                timestamp: 5,
                version: "0.1.0".to_string()
            }
        );
    }
}
