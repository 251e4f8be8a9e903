//! Line framing for the incoming IRC byte stream.
//!
//! [`LineCodec`] splits on `\n`, strips one trailing `\r` and decodes each
//! line through a chain of [`Charset`]s, since IRC servers relay whatever
//! bytes clients send. A line no charset accepts is dropped. [`LineFramer`]
//! owns the pending bytes for one connection.

use std::borrow::Cow;
use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// A text encoding tried when decoding an incoming line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Charset {
    /// Strict UTF-8.
    Utf8,
    /// Windows code page 1252. Lines containing one of its five
    /// unassigned bytes (0x81, 0x8D, 0x8F, 0x90, 0x9D) are rejected.
    Windows1252,
    /// ISO-8859-1, every byte maps to the code point of the same value.
    Latin1,
}

/// Bytes with no character assigned in CP-1252.
const CP1252_UNASSIGNED: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

/// UTF-8, then CP-1252, then ISO-8859-1.
pub const DEFAULT_CHARSETS: [Charset; 3] = [Charset::Utf8, Charset::Windows1252, Charset::Latin1];

impl Charset {
    /// Decode `bytes`, or `None` if they are not valid in this charset.
    pub fn decode(self, bytes: &[u8]) -> Option<Cow<'_, str>> {
        match self {
            Charset::Utf8 => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
            Charset::Windows1252 => {
                // encoding_rs maps these to C1 controls instead of failing
                if bytes.iter().any(|b| CP1252_UNASSIGNED.contains(b)) {
                    return None;
                }
                encoding::WINDOWS_1252.decode_without_bom_handling_and_without_replacement(bytes)
            }
            Charset::Latin1 => Some(Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())),
        }
    }
}

/// Codec turning a byte stream into decoded lines and lines into CRLF-terminated bytes.
#[derive(Clone, Debug)]
pub struct LineCodec {
    charsets: Vec<Charset>,
    next_index: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Codec using [`DEFAULT_CHARSETS`].
    pub fn new() -> Self {
        Self::with_charsets(DEFAULT_CHARSETS)
    }

    /// Codec trying `charsets` in order.
    pub fn with_charsets(charsets: impl IntoIterator<Item = Charset>) -> Self {
        Self {
            charsets: charsets.into_iter().collect(),
            next_index: 0,
        }
    }

    /// Charsets tried, in order.
    pub fn charsets(&self) -> &[Charset] {
        &self.charsets
    }

    /// Split the next decodable line off `src`.
    ///
    /// Undecodable lines are consumed and skipped. Returns `None` once `src`
    /// holds no complete line.
    pub fn next_line(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            // bytes before next_index were already scanned
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                return None;
            };

            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let mut content = &line[..line.len() - 1];
            if let [rest @ .., b'\r'] = content {
                content = rest;
            }

            match self.decode_text(content) {
                Some(text) => return Some(text),
                None => debug!(len = content.len(), "Discarding line with unknown encoding"),
            }
        }
    }

    /// Forget any partially scanned line.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    fn decode_text(&self, bytes: &[u8]) -> Option<String> {
        self.charsets
            .iter()
            .find_map(|charset| charset.decode(bytes))
            .map(Cow::into_owned)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        Ok(self.next_line(src))
    }
}

impl Encoder<&str> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> io::Result<()> {
        encode_line(line, dst)
    }
}

/// Append `line` and a CRLF terminator to `dst`.
///
/// Fails with [`io::ErrorKind::InvalidInput`] if `line` itself contains CR or LF.
pub fn encode_line(line: &str, dst: &mut BytesMut) -> io::Result<()> {
    if line.contains(['\r', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line contains a line terminator",
        ));
    }

    dst.reserve(line.len() + 2);
    dst.put(line.as_bytes());
    dst.put(&b"\r\n"[..]);
    Ok(())
}

/// The incoming buffer of one connection.
///
/// Holds at most one partial line between calls once every complete line
/// has been taken out with [`next_line`](Self::next_line).
#[derive(Debug, Default)]
pub struct LineFramer {
    codec: LineCodec,
    buffer: BytesMut,
}

impl LineFramer {
    /// Framer using the default charset chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer driving the given codec.
    pub fn with_codec(codec: LineCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete line, if any.
    pub fn next_line(&mut self) -> Option<String> {
        self.codec.next_line(&mut self.buffer)
    }

    /// Append `data` and return every line it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.push(data);
        std::iter::from_fn(|| self.next_line()).collect()
    }

    /// Drop any pending partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.codec.reset();
    }

    /// Number of buffered bytes not yet part of a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_and_lf_decode_identically() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b":irc.example.net 001 bot :Welcome\r\nPING :abc\n");
        assert_eq!(lines, vec![":irc.example.net 001 bot :Welcome", "PING :abc"]);
        assert!(framer.is_empty());
    }

    #[test]
    fn test_partial_line_is_kept() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"PRIVMSG #rust :hel").is_empty());
        assert_eq!(framer.pending(), 18);
        assert!(framer.feed(b"lo").is_empty());
        assert_eq!(framer.feed(b"\r"), Vec::<String>::new());
        assert_eq!(framer.feed(b"\nPING"), vec!["PRIVMSG #rust :hello"]);
        assert_eq!(framer.pending(), 4);
    }

    #[test]
    fn test_only_one_carriage_return_is_stripped() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"odd\r\r\n"), vec!["odd\r"]);
        assert_eq!(framer.feed(b"\r\n\n"), vec!["", ""]);
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut framer = LineFramer::new();
        let text = "PRIVMSG #café :👋\r\n".as_bytes();
        let (head, tail) = text.split_at(13);
        assert!(framer.feed(head).is_empty());
        assert_eq!(framer.feed(tail), vec!["PRIVMSG #café :👋"]);
    }

    #[test]
    fn test_windows_1252_fallback() {
        let mut framer = LineFramer::new();
        // 0xe9 is é and 0x80 is the euro sign in CP-1252
        let lines = framer.feed(b"PRIVMSG #fr :caf\xe9 5\x80\r\n");
        assert_eq!(lines, vec!["PRIVMSG #fr :café 5€"]);
    }

    #[test]
    fn test_latin1_fallback() {
        // CP-1252 left out so Latin-1 has to take it
        let codec = LineCodec::with_charsets([Charset::Utf8, Charset::Latin1]);
        let mut framer = LineFramer::with_codec(codec);
        assert_eq!(framer.feed(b"x\x81\xff\n"), vec!["x\u{81}\u{ff}"]);
    }

    #[test]
    fn test_cp1252_unassigned_byte_falls_through_to_latin1() {
        let mut framer = LineFramer::new();
        // 0x80 alone would be the euro sign; 0x81 forces the whole line to Latin-1
        assert_eq!(framer.feed(b"x\x80\x81\n"), vec!["x\u{80}\u{81}"]);
        assert_eq!(Charset::Windows1252.decode(b"\x9d"), None);
        assert_eq!(Charset::Windows1252.decode(b"\x80").as_deref(), Some("€"));
    }

    #[test]
    fn test_undecodable_line_is_dropped() {
        let codec = LineCodec::with_charsets([Charset::Utf8]);
        let mut framer = LineFramer::with_codec(codec);
        let lines = framer.feed(b"first\r\n\xff\xfe broken\r\nsec");
        assert_eq!(lines, vec!["first"]);
        assert_eq!(framer.feed(b"ond\r\n"), vec!["second"]);
    }

    #[test]
    fn test_clear_discards_partial_line() {
        let mut framer = LineFramer::new();
        framer.feed(b"truncated PRIV");
        framer.clear();
        assert!(framer.is_empty());
        assert_eq!(framer.feed(b"PING :x\r\n"), vec!["PING :x"]);
    }

    #[test]
    fn test_decoder_over_framed_bytes() {
        let mut codec = LineCodec::new();
        let mut src = BytesMut::from(&b"a\r\nb\nc"[..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some("a".to_string()));
        assert_eq!(codec.decode(&mut src).unwrap(), Some("b".to_string()));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(&src[..], b"c");
    }

    #[test]
    fn test_encoder_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("PING irc.example.net", &mut dst).unwrap();
        assert_eq!(&dst[..], b"PING irc.example.net\r\n");
    }

    #[test]
    fn test_encoder_rejects_embedded_terminators() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        let err = codec.encode("PRIVMSG #a :x\r\nQUIT", &mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(dst.is_empty());
    }
}
