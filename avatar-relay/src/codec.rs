//! Newline framing for the relay's byte streams.
//!
//! The decoder yields raw lines (trailing whitespace stripped, possibly
//! empty); turning them into [`Message`]s is left to [`Message::parse`] so the
//! relay can apply its drop-and-continue policy per line.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

/// Maximum accepted line length, newline included. Avatar payloads travel
/// inline as base64, so this is far above any chat line.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream on `\n`.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes already scanned without finding a newline.
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let line_bytes = src.split_to(self.scanned + offset);
                src.advance(1);
                self.scanned = 0;

                // Peers are not trusted to send valid UTF-8; keep what we can.
                let line = String::from_utf8_lossy(&line_bytes);
                Ok(Some(line.trim_end().to_string()))
            }
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // An unterminated tail at disconnect is not a line.
        src.clear();
        self.scanned = 0;
        Ok(None)
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_string();
        dst.reserve(wire.len() + 1);
        dst.put_slice(wire.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
