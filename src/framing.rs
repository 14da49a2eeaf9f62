use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Newline framing for the station byte stream.
///
/// Reads may carry several lines or only part of one; the unterminated tail
/// stays in the buffer until the rest arrives. A trailing `\r` is dropped and
/// invalid UTF-8 is replaced rather than rejected. A line longer than the
/// codec's maximum is an `InvalidData` error. Outbound commands get a `\n`
/// appended.
#[derive(Debug)]
pub struct LineCodec {
    /// Bytes already scanned for a newline
    next_index: usize,
    max_length: usize,
}

/// Longest inbound line accepted by [`LineCodec::new`], excluding the newline
pub const MAX_LINE_LENGTH: usize = 4096;

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn too_long(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", self.max_length),
        )
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
            if buf.len() > self.max_length {
                return Err(self.too_long());
            }
            self.next_index = buf.len();
            return Ok(None);
        };

        let newline = self.next_index + offset;
        self.next_index = 0;
        if newline > self.max_length {
            return Err(self.too_long());
        }
        let frame = buf.split_to(newline + 1);
        Ok(Some(to_line(&frame[..newline])))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Peer closed mid-line; hand over what we have
        self.next_index = 0;
        if buf.len() > self.max_length {
            return Err(self.too_long());
        }
        let rest = buf.split();
        Ok(Some(to_line(&rest)))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, command: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(command.len() + 1);
        dst.put_slice(command.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn partial_line_is_held_until_terminated() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("<r ");
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"5>\n");
        assert_eq!(drain(&mut codec, &mut buf), vec!["<r 5>".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn several_lines_in_one_read() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("*\r\nMTA0L3<;>V50\n<w 3>\n<v 1");
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec!["*", "MTA0L3<;>V50", "<w 3>"]
        );
        assert_eq!(&buf[..], b"<v 1");
    }

    #[test]
    fn eof_flushes_the_unterminated_tail() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("<r 5>\n<w");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("<r 5>".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("<w".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"<r \xff>\n"[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec!["<r \u{fffd}>".to_string()]);
    }

    #[test]
    fn overlong_lines_are_rejected() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from("<r 5>\n<w 12345");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("<r 5>".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"6789");
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut terminated = BytesMut::from("123456789\n");
        let err = LineCodec::with_max_length(8)
            .decode(&mut terminated)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        assert_eq!(LineCodec::new().max_length(), MAX_LINE_LENGTH);
    }

    #[test]
    fn encoder_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("<t 3 63 1>".to_string(), &mut buf).unwrap();
        codec.encode("<!>".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"<t 3 63 1>\n<!>\n");
    }
}
