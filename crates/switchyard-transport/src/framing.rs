//! Record framing for brace-delimited text records.
//!
//! Every envelope travels as one JSON object. Instead of a length prefix,
//! the receiver finds the end of a record by tracking nested-brace depth,
//! ignoring braces that appear inside quoted strings (and escaped quotes
//! inside those strings). Whitespace between records is skipped, so the
//! encoder terminates each record with a newline for readability.
//!
//! The decoder is incremental: it remembers how far it has scanned, so a
//! record arriving in many small TCP reads is scanned once, not once per
//! read.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::TransportError;

/// A [`Decoder`]/[`Encoder`] pair for brace-balanced records.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_len: usize,
    /// Bytes of the current record already scanned.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// `true` once the opening brace of the current record was seen.
    open: bool,
}

impl RecordCodec {
    /// Largest record accepted by default (1 MiB).
    pub const DEFAULT_MAX_RECORD: usize = 1024 * 1024;

    /// Creates a codec with the default record limit.
    pub fn new() -> Self {
        Self::with_max_len(Self::DEFAULT_MAX_RECORD)
    }

    /// Creates a codec that rejects records longer than `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            open: false,
        }
    }

    /// Returns the configured record limit.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.open = false;
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = BytesMut;
    type Error = TransportError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<BytesMut>, TransportError> {
        if !self.open {
            let blank = src
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            src.advance(blank);
            let Some(&first) = src.first() else {
                return Ok(None);
            };
            if first != b'{' {
                return Err(TransportError::MalformedRecord(format!(
                    "expected '{{' at record start, found byte 0x{first:02x}"
                )));
            }
            self.open = true;
        }

        while self.scanned < src.len() {
            let byte = src[self.scanned];
            self.scanned += 1;
            if self.scanned > self.max_len {
                return Err(TransportError::RecordTooLarge {
                    len: self.scanned,
                    max: self.max_len,
                });
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let record = src.split_to(self.scanned);
                        self.reset();
                        return Ok(Some(record));
                    }
                }
                _ => {}
            }
        }

        Ok(None)
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<BytesMut>, TransportError> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.iter().all(u8::is_ascii_whitespace) => Ok(None),
            None => Err(TransportError::MalformedRecord(format!(
                "stream ended inside a record ({} bytes pending)",
                src.len()
            ))),
        }
    }
}

impl Encoder<&[u8]> for RecordCodec {
    type Error = TransportError;

    fn encode(
        &mut self,
        record: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), TransportError> {
        if record.len() > self.max_len {
            return Err(TransportError::RecordTooLarge {
                len: record.len(),
                max: self.max_len,
            });
        }
        dst.reserve(record.len() + 1);
        dst.put_slice(record);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut RecordCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(record) = codec.decode(buf).expect("decode") {
            out.push(String::from_utf8(record.to_vec()).expect("utf8"));
        }
        out
    }

    #[test]
    fn test_decode_single_record_returns_it() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&br#"{"a":1}"#[..]);

        let records = decode_all(&mut codec, &mut buf);

        assert_eq!(records, vec![r#"{"a":1}"#]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_nested_braces_waits_for_outermost_close() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&br#"{"a":{"b":{}}"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"}");
        let record = codec.decode(&mut buf).unwrap().expect("complete");
        assert_eq!(&record[..], br#"{"a":{"b":{}}}"#);
    }

    #[test]
    fn test_decode_braces_inside_strings_are_ignored() {
        let mut codec = RecordCodec::new();
        let mut buf =
            BytesMut::from(&br#"{"text":"}}{{ \"quoted }\" {"}{"x":2}"#[..]);

        let records = decode_all(&mut codec, &mut buf);

        assert_eq!(
            records,
            vec![r#"{"text":"}}{{ \"quoted }\" {"}"#, r#"{"x":2}"#]
        );
    }

    #[test]
    fn test_decode_escaped_backslash_before_quote_closes_string() {
        // "\\" is an escaped backslash; the following quote ends the string.
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&br#"{"p":"c:\\"}"#[..]);

        let records = decode_all(&mut codec, &mut buf);

        assert_eq!(records, vec![r#"{"p":"c:\\"}"#]);
    }

    #[test]
    fn test_decode_record_split_across_reads() {
        let mut codec = RecordCodec::new();
        let whole = br#"{"payload":"abc{","targets":["x"]}"#;
        let mut buf = BytesMut::new();

        for chunk in whole.chunks(3) {
            buf.extend_from_slice(chunk);
            if buf.len() < whole.len() {
                assert!(codec.decode(&mut buf).unwrap().is_none());
            }
        }

        let record = codec.decode(&mut buf).unwrap().expect("complete");
        assert_eq!(&record[..], &whole[..]);
    }

    #[test]
    fn test_decode_skips_whitespace_between_records() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&b"  {\"a\":1}\n\r\n\t{\"b\":2}\n"[..]);

        let records = decode_all(&mut codec, &mut buf);

        assert_eq!(records, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn test_decode_garbage_returns_malformed() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&b"hello"[..]);

        let result = codec.decode(&mut buf);

        assert!(matches!(result, Err(TransportError::MalformedRecord(_))));
    }

    #[test]
    fn test_decode_oversized_record_returns_too_large() {
        let mut codec = RecordCodec::with_max_len(16);
        let mut buf = BytesMut::from(&br#"{"k":"0123456789abcdef"}"#[..]);

        let result = codec.decode(&mut buf);

        assert!(matches!(
            result,
            Err(TransportError::RecordTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_decode_eof_inside_record_is_error() {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(&br#"{"a":"#[..]);

        let result = codec.decode_eof(&mut buf);

        assert!(matches!(result, Err(TransportError::MalformedRecord(_))));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = RecordCodec::new();
        let mut dst = BytesMut::new();

        codec.encode(&br#"{"a":1}"#[..], &mut dst).unwrap();

        assert_eq!(&dst[..], b"{\"a\":1}\n");
    }
}
