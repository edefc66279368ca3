//! Line framing for tokio.
//!
//! [`LineCodec`] splits the byte stream on `\n` (accepting an optional
//! preceding `\r`) and appends `\r\n` on encode. Oversized lines are not
//! fatal: the decoder yields an `Err(FrameTooLong)` item, discards bytes up
//! to the next terminator and resumes with the following line.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// RFC 1459 line limit, terminator included.
pub const DEFAULT_MAX_LINE_LEN: usize = 512;

const TERMINATOR: &str = "\r\n";

/// Line-based codec with a length limit.
#[derive(Debug)]
pub struct LineCodec {
    /// Index of next byte to check for newline
    next_index: usize,
    /// Maximum line length, terminator included
    max_len: usize,
    /// Skipping the tail of an oversized line
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a codec with a custom max line length (in bytes, terminator included).
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len: max_len.max(TERMINATOR.len() + 1),
            discarding: false,
        }
    }

    /// Prepare an outgoing line: cut at the first line break (no injection of
    /// extra commands) and trim to the length budget on a char boundary.
    pub fn sanitize(line: &str, max_len: usize) -> &str {
        let line = match line.find(['\r', '\n']) {
            Some(pos) => &line[..pos],
            None => line,
        };
        let budget = max_len.saturating_sub(TERMINATOR.len());
        if line.len() <= budget {
            return line;
        }
        let mut end = budget;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        &line[..end]
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

impl Decoder for LineCodec {
    /// Per-line outcome; only `FrameTooLong` is ever reported here.
    type Item = Result<String>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.advance(src.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let line = src.split_to(self.next_index + offset + 1);
                    self.next_index = 0;

                    if line.len() > self.max_len {
                        return Ok(Some(Err(Error::FrameTooLong {
                            actual: line.len(),
                            limit: self.max_len,
                        })));
                    }
                    return Ok(Some(Ok(decode_line(&line))));
                }
                (false, None) => {
                    if src.len() > self.max_len {
                        let actual = src.len();
                        src.advance(actual);
                        self.next_index = 0;
                        self.discarding = true;
                        return Ok(Some(Err(Error::FrameTooLong {
                            actual,
                            limit: self.max_len,
                        })));
                    }
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    tracing::debug!(bytes = src.len(), "Dropping unterminated line at EOF");
                    src.clear();
                }
                self.next_index = 0;
                self.discarding = false;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        let line = Self::sanitize(&line, self.max_len);
        dst.reserve(line.len() + TERMINATOR.len());
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(TERMINATOR.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(codec: &mut LineCodec, buf: &mut BytesMut) -> Option<Result<String>> {
        codec.decode(buf).unwrap()
    }

    #[test]
    fn decode_complete_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :test\r\n");

        let line = next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(line, "PING :test");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_is_buffered() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :te");
        assert!(next(&mut codec, &mut buf).is_none());

        buf.extend_from_slice(b"st\r\nNICK");
        let line = next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(line, "PING :test");
        assert!(next(&mut codec, &mut buf).is_none());
        assert_eq!(&buf[..], b"NICK");
    }

    #[test]
    fn decode_bare_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :a\nPING :b\n");
        assert_eq!(next(&mut codec, &mut buf).unwrap().unwrap(), "PING :a");
        assert_eq!(next(&mut codec, &mut buf).unwrap().unwrap(), "PING :b");
    }

    #[test]
    fn decode_too_long_then_continues() {
        let mut codec = LineCodec::with_max_len(10);
        let mut buf = BytesMut::from("this is way too long\r\nPING :x\r\n");

        let item = next(&mut codec, &mut buf).unwrap();
        assert!(matches!(item, Err(Error::FrameTooLong { limit: 10, .. })));

        let line = next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(line, "PING :x");
    }

    #[test]
    fn decode_too_long_partial_discards_until_terminator() {
        let mut codec = LineCodec::with_max_len(10);
        let mut buf = BytesMut::from("aaaaaaaaaaaaaaaa");

        let item = next(&mut codec, &mut buf).unwrap();
        assert!(matches!(item, Err(Error::FrameTooLong { actual: 16, .. })));
        assert!(buf.is_empty());

        buf.extend_from_slice(b"more junk");
        assert!(next(&mut codec, &mut buf).is_none());

        buf.extend_from_slice(b" end\r\nPONG :y\r\n");
        let line = next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(line, "PONG :y");
    }

    #[test]
    fn decode_invalid_utf8_is_lossy() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #c :caf\xe9\r\n"[..]);
        let line = next(&mut codec, &mut buf).unwrap().unwrap();
        assert!(line.starts_with("PRIVMSG #c :caf"));
    }

    #[test]
    fn encode_appends_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("PONG :test".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG :test\r\n");
    }

    #[test]
    fn encode_cuts_injected_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode("PRIVMSG #c :hi\r\nQUIT :bye".to_string(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PRIVMSG #c :hi\r\n");
    }

    #[test]
    fn encode_trims_to_limit_on_char_boundary() {
        let mut codec = LineCodec::with_max_len(8);
        let mut buf = BytesMut::new();
        codec.encode("abcdeéfg".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], "abcde\r\n".as_bytes());
    }

    #[test]
    fn encode_then_decode_returns_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        for line in [":srv 001 bot :Welcome", "PRIVMSG #chan :!frc now", "PING"] {
            codec.encode(line.to_string(), &mut buf).unwrap();
            assert_eq!(next(&mut codec, &mut buf).unwrap().unwrap(), line);
        }
    }
}
