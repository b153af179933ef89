//! Bencode codec for the backend wire protocol.
//!
//! nREPL frames are bencode dictionaries:
//! ```text
//! d2:op5:clone2:id1:1e
//! ```
//! Integers are `i<n>e`, byte strings are `<len>:<bytes>`, lists are
//! `l...e`, and dictionaries are `d...e` with keys in sorted order. String
//! values arrive as raw bytes and are decoded to text only at the point of
//! use.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Read};

use thiserror::Error;

/// Upper bound on a single byte-string payload, guarding against a
/// corrupted length prefix allocating unbounded memory.
const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed integer (`i<n>e`).
    Int(i64),
    /// Raw byte string (`<len>:<bytes>`).
    Bytes(Vec<u8>),
    /// Heterogeneous list (`l...e`).
    List(Vec<Value>),
    /// Dictionary with string keys (`d...e`).
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a byte-string value from text.
    #[must_use]
    pub fn string(text: impl Into<String>) -> Self {
        Self::Bytes(text.into().into_bytes())
    }

    /// Builds a dictionary from string key/value pairs.
    ///
    /// This is the shape of every outbound request frame: operation name,
    /// request id, session token, and operation-specific fields.
    #[must_use]
    pub fn request(pairs: &[(&str, &str)]) -> Self {
        let entries = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), Self::string(*value)))
            .collect();
        Self::Dict(entries)
    }

    /// Returns the decoded text of a byte-string value.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; backend output is
    /// display text, not data.
    #[must_use]
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Bytes(bytes) => Some(String::from_utf8_lossy(bytes)),
            Self::Int(_) | Self::List(_) | Self::Dict(_) => None,
        }
    }

    /// Looks up a dictionary entry by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Dict(entries) => entries.get(key),
            Self::Int(_) | Self::Bytes(_) | Self::List(_) => None,
        }
    }

    /// Returns the decoded text of the dictionary entry at `key`.
    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).and_then(Self::as_text)
    }

    /// Reports whether the `status` list of a reply frame contains `marker`.
    ///
    /// A reply sequence is terminal exactly when a frame's status carries
    /// the `done` marker.
    #[must_use]
    pub fn status_contains(&self, marker: &str) -> bool {
        match self.get("status") {
            Some(Self::List(items)) => items
                .iter()
                .any(|item| item.as_text().is_some_and(|text| text == marker)),
            Some(Self::Bytes(bytes)) => String::from_utf8_lossy(bytes) == marker,
            _ => false,
        }
    }

    /// Serialises the value into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(entries) => {
                out.push(b'd');
                // BTreeMap iteration already yields sorted keys.
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key.as_bytes());
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Serialises the value to a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// Errors raised while decoding a bencode frame.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// I/O failure while reading frame bytes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A byte that no bencode production starts with.
    #[error("unexpected byte 0x{byte:02x} in frame")]
    UnexpectedByte {
        /// The offending byte.
        byte: u8,
    },

    /// Integer or length field that does not parse.
    #[error("invalid {field} field")]
    InvalidField {
        /// Which field failed to parse.
        field: &'static str,
    },

    /// Byte-string length beyond the sanity bound.
    #[error("string of {len} bytes exceeds the {MAX_STRING_BYTES} byte limit")]
    OversizedString {
        /// Declared payload length.
        len: usize,
    },

    /// Dictionary key that is not valid UTF-8.
    #[error("dictionary key is not valid UTF-8")]
    NonUtf8Key,

    /// Dictionary key position held a non-string value.
    #[error("dictionary key is not a byte string")]
    NonStringKey,
}

/// Streaming decoder that reads exactly one value per call.
///
/// The decoder never partially consumes a frame: a successful call leaves
/// the reader positioned at the next frame boundary, and a failed call
/// surfaces a [`BencodeError`] rather than returning a truncated value.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: Read> Decoder<R> {
    /// Wraps a reader positioned at a frame boundary.
    pub const fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads one complete value.
    ///
    /// # Errors
    ///
    /// Returns [`BencodeError`] on I/O failure or malformed input.
    pub fn read_value(&mut self) -> Result<Value, BencodeError> {
        let first = self.read_byte()?;
        self.parse(first)
    }

    fn parse(&mut self, first: u8) -> Result<Value, BencodeError> {
        match first {
            b'i' => self.parse_int(),
            b'0'..=b'9' => self.parse_bytes(first),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            byte => Err(BencodeError::UnexpectedByte { byte }),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        let mut digits = String::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'e' {
                break;
            }
            digits.push(char::from(byte));
        }
        digits
            .parse()
            .map(Value::Int)
            .map_err(|_| BencodeError::InvalidField { field: "integer" })
    }

    fn parse_bytes(&mut self, first_digit: u8) -> Result<Value, BencodeError> {
        let mut digits = String::from(char::from(first_digit));
        loop {
            let byte = self.read_byte()?;
            if byte == b':' {
                break;
            }
            if !byte.is_ascii_digit() {
                return Err(BencodeError::InvalidField { field: "length" });
            }
            digits.push(char::from(byte));
        }
        let len: usize = digits
            .parse()
            .map_err(|_| BencodeError::InvalidField { field: "length" })?;
        if len > MAX_STRING_BYTES {
            return Err(BencodeError::OversizedString { len });
        }
        let mut payload = vec![0_u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(Value::Bytes(payload))
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        let mut items = Vec::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'e' {
                return Ok(Value::List(items));
            }
            items.push(self.parse(byte)?);
        }
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        let mut entries = BTreeMap::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'e' {
                return Ok(Value::Dict(entries));
            }
            let key = match self.parse(byte)? {
                Value::Bytes(bytes) => {
                    String::from_utf8(bytes).map_err(|_| BencodeError::NonUtf8Key)?
                }
                Value::Int(_) | Value::List(_) | Value::Dict(_) => {
                    return Err(BencodeError::NonStringKey);
                }
            };
            let value = self.read_value()?;
            entries.insert(key, value);
        }
    }

    fn read_byte(&mut self) -> Result<u8, BencodeError> {
        let mut buf = [0_u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

/// Incremental frame reader over a poll-style byte source.
///
/// Bytes are accumulated in an internal buffer and a frame is surfaced only
/// once it is complete, so a read timeout mid-frame never discards partial
/// decode state: the next call resumes from the buffered bytes. Timeout and
/// other source errors pass through as [`BencodeError::Io`] for the caller
/// to classify.
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    pending: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte source positioned at a frame boundary.
    pub const fn new(source: R) -> Self {
        Self {
            source,
            pending: Vec::new(),
        }
    }

    /// Reads one complete frame, buffering any trailing partial bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BencodeError::Io`] when the source fails or closes before a
    /// complete frame, and other [`BencodeError`] variants for malformed
    /// input. The buffer is preserved across `WouldBlock`/`TimedOut` errors.
    pub fn read_frame(&mut self) -> Result<Value, BencodeError> {
        loop {
            if !self.pending.is_empty() {
                let mut cursor = io::Cursor::new(self.pending.as_slice());
                let attempt = Decoder::new(&mut cursor).read_value();
                let consumed = usize::try_from(cursor.position()).unwrap_or(self.pending.len());
                match attempt {
                    Ok(frame) => {
                        self.pending.drain(..consumed);
                        return Ok(frame);
                    }
                    // A clean end of the buffer means the frame is still in
                    // flight; anything else is genuinely malformed.
                    Err(BencodeError::Io(error))
                        if error.kind() == io::ErrorKind::UnexpectedEof => {}
                    Err(error) => return Err(error),
                }
            }

            let mut chunk = [0_u8; 4096];
            match self.source.read(&mut chunk) {
                Ok(0) => {
                    return Err(BencodeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source closed before a complete frame",
                    )));
                }
                Ok(count) => self
                    .pending
                    .extend_from_slice(chunk.get(..count).unwrap_or_default()),
                Err(error) => return Err(BencodeError::Io(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;

    fn decode(bytes: &[u8]) -> Result<Value, BencodeError> {
        Decoder::new(Cursor::new(bytes.to_vec())).read_value()
    }

    #[rstest]
    fn encodes_clone_request_with_sorted_keys() {
        let request = Value::request(&[("op", "clone"), ("id", "1")]);
        assert_eq!(request.to_bytes(), b"d2:id1:12:op5:clonee");
    }

    #[rstest]
    fn decodes_eval_reply_frame() {
        let frame = decode(b"d2:ns4:user7:session9:aaaa-bbbb5:value1:6e").expect("decode frame");
        assert_eq!(frame.get_text("value").as_deref(), Some("6"));
        assert_eq!(frame.get_text("ns").as_deref(), Some("user"));
        assert_eq!(frame.get_text("session").as_deref(), Some("aaaa-bbbb"));
    }

    #[rstest]
    fn detects_done_status_marker() {
        let frame = decode(b"d6:statusl4:doneee").expect("decode frame");
        assert!(frame.status_contains("done"));
        assert!(!frame.status_contains("eval-error"));
    }

    #[rstest]
    fn round_trips_nested_structures() {
        let mut entries = BTreeMap::new();
        entries.insert("id".to_owned(), Value::Int(7));
        entries.insert(
            "status".to_owned(),
            Value::List(vec![Value::string("done"), Value::string("error")]),
        );
        let original = Value::Dict(entries);

        let decoded = decode(&original.to_bytes()).expect("decode round trip");
        assert_eq!(decoded, original);
    }

    #[rstest]
    fn decodes_negative_integer() {
        assert_eq!(decode(b"i-42e").expect("decode"), Value::Int(-42));
    }

    #[rstest]
    #[case::garbage_prefix(b"x3:abc".as_slice())]
    #[case::bad_length(b"3x:abc".as_slice())]
    #[case::bad_integer(b"iabce".as_slice())]
    fn rejects_malformed_input(#[case] input: &[u8]) {
        assert!(decode(input).is_err());
    }

    #[rstest]
    fn truncated_payload_is_io_error() {
        let result = decode(b"10:short");
        assert!(matches!(result, Err(BencodeError::Io(_))));
    }

    #[rstest]
    fn rejects_non_string_dictionary_key() {
        let result = decode(b"di1e3:abce");
        assert!(matches!(result, Err(BencodeError::NonStringKey)));
    }

    #[rstest]
    fn decodes_lossy_text_from_invalid_utf8() {
        let frame = decode(b"d3:out4:a\xff\xfebe" as &[u8]).expect("decode frame");
        let text = frame.get_text("out").expect("out field");
        assert!(text.starts_with('a'));
        assert!(text.ends_with('b'));
    }

    /// A source that yields scripted chunks, with empty chunks standing in
    /// for an expired read poll.
    struct StutteringSource {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for StutteringSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            if chunk.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "poll expired"));
            }
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[rstest]
    fn frame_reader_resumes_after_mid_frame_poll_expiry() {
        let mut reader = FrameReader::new(StutteringSource {
            chunks: vec![b"d3:ou".to_vec(), Vec::new(), b"t5:helloe".to_vec()],
        });

        let first = reader.read_frame();
        assert!(matches!(
            first,
            Err(BencodeError::Io(ref error)) if error.kind() == io::ErrorKind::WouldBlock
        ));

        let frame = reader.read_frame().expect("frame completes on retry");
        assert_eq!(frame.get_text("out").as_deref(), Some("hello"));
    }

    #[rstest]
    fn frame_reader_splits_back_to_back_frames() {
        let mut reader = FrameReader::new(StutteringSource {
            chunks: vec![b"d5:value1:6ed6:statusl4:doneee".to_vec()],
        });

        let first = reader.read_frame().expect("first frame");
        assert_eq!(first.get_text("value").as_deref(), Some("6"));

        let second = reader.read_frame().expect("second frame");
        assert!(second.status_contains("done"));
    }
}
