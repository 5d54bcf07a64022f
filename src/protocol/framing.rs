//! Line framing for the control channel
//!
//! Control messages are UTF-8 JSON objects, one per line, LF-terminated.
//! The codec consumes raw socket reads and yields complete lines; a line
//! longer than [`MAX_LINE_LEN`] is a protocol violation and the session is
//! expected to close after replying `error: "frame too large"`.

use bytes::{Buf, BytesMut};
use std::io;

/// Maximum encoded line length (64 KiB), terminator included
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Streaming decoder for LF-delimited lines
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: BytesMut,
}

impl LineCodec {
    /// Create a new line codec
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed raw bytes into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete line
    ///
    /// Returns `Ok(Some(line))` with the terminator stripped, `Ok(None)` if
    /// more data is needed, and an error for oversize or non-UTF-8 lines.
    pub fn decode_next(&mut self) -> io::Result<Option<String>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos + 1 > MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame too large",
                    ));
                }
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let text = String::from_utf8(line.to_vec()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "frame is not valid UTF-8")
                })?;
                Ok(Some(text))
            }
            None => {
                if self.buffer.len() > MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame too large",
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Get the current buffered length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered data
    pub fn clear(&mut self) {
        self.buffer.advance(self.buffer.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut codec = LineCodec::new();
        codec.feed(b"{\"type\":\"heartbeat\"}\n");
        assert_eq!(
            codec.decode_next().unwrap().as_deref(),
            Some("{\"type\":\"heartbeat\"}")
        );
        assert!(codec.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_split_feed() {
        let mut codec = LineCodec::new();
        codec.feed(b"{\"type\":\"log");
        assert!(codec.decode_next().unwrap().is_none());
        codec.feed(b"out\"}\nextra");
        assert_eq!(
            codec.decode_next().unwrap().as_deref(),
            Some("{\"type\":\"logout\"}")
        );
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 5);
    }

    #[test]
    fn test_multiple_lines_one_feed() {
        let mut codec = LineCodec::new();
        codec.feed(b"one\ntwo\r\nthree\n");
        assert_eq!(codec.decode_next().unwrap().as_deref(), Some("one"));
        assert_eq!(codec.decode_next().unwrap().as_deref(), Some("two"));
        assert_eq!(codec.decode_next().unwrap().as_deref(), Some("three"));
        assert!(codec.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_oversize_line_without_terminator() {
        let mut codec = LineCodec::new();
        codec.feed(&vec![b'a'; MAX_LINE_LEN + 1]);
        assert!(codec.decode_next().is_err());
    }

    #[test]
    fn test_oversize_line_with_terminator() {
        let mut codec = LineCodec::new();
        let mut data = vec![b'a'; MAX_LINE_LEN];
        data.push(b'\n');
        codec.feed(&data);
        assert!(codec.decode_next().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = LineCodec::new();
        codec.feed(&[0xff, 0xfe, b'\n']);
        assert!(codec.decode_next().is_err());
    }
}
