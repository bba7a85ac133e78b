//! Text message codec.
//!
//! The wire format is raw UTF-8 bytes: no length prefix, no delimiter, no
//! header. One [`Message`] corresponds to the bytes observed in a single read
//! event. There is deliberately no framing: a payload larger than the read
//! buffer (or one the kernel delivers in pieces) will surface as multiple
//! messages, and back-to-back writes from a fast sender may coalesce into
//! one. Sessions send at most one message per connection, which makes
//! one-read-one-message the common case, but it is not a guarantee.

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// An opaque payload, logically UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    pub fn from_bytes(bytes: Bytes) -> Self {
        Message(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text view of the payload. Invalid UTF-8 is replaced, not rejected;
    /// the payload itself stays byte-exact.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Pass-through codec between text and wire bytes.
pub struct TextCodec;

impl TextCodec {
    /// Encode text for the wire. The payload of one send call is written
    /// as-is.
    pub fn encode(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    /// Decode the bytes delivered by one read event as one message.
    pub fn decode(bytes: &[u8]) -> Message {
        Message(Bytes::copy_from_slice(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_byte_exact() {
        let encoded = TextCodec::encode("My message 42");
        let decoded = TextCodec::decode(&encoded);
        assert_eq!(decoded.as_bytes(), b"My message 42");
        assert_eq!(decoded.as_text(), "My message 42");
    }

    #[test]
    fn test_decode_invalid_utf8_is_lossy_not_fatal() {
        let decoded = TextCodec::decode(&[0x66, 0x6f, 0xff, 0x6f]);
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded.as_text(), "fo\u{fffd}o");
    }

    #[test]
    fn test_empty_message() {
        let decoded = TextCodec::decode(&[]);
        assert!(decoded.is_empty());
        assert_eq!(decoded.to_string(), "");
    }
}
