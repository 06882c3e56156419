//! Wire envelope for the coordination protocol.
//!
//! A message is one JSON object: no terminator, no length prefix. The receiver knows a
//! message is complete when it decodes. A prefix of a valid message fails with
//! [`MessageError::Incomplete`] so the receiver keeps buffering; anything else that fails
//! to parse is [`MessageError::Corrupt`].
//!
//! [`MessageCodec`] applies those rules to a socket through `FramedRead`/`FramedWrite`.

use std::io;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Verbs understood by the coordination server, and the verbs it replies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    Put,
    Get,
    Delete,
    Register,
    Exit,
    Status,

    /// PUT stored a path that did not exist.
    New,
    /// PUT overwrote an existing path.
    Updated,
    Hit,
    Miss,
    Ok,
    Welcome,
    Bye,
    /// The server could not act on the request.
    Error,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Register => "REGISTER",
            Self::Exit => "EXIT",
            Self::Status => "STATUS",
            Self::New => "NEW",
            Self::Updated => "UPDATED",
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Ok => "OK",
            Self::Welcome => "WELCOME",
            Self::Bye => "BYE",
            Self::Error => "ERROR",
        }
    }

    /// True for verbs a client may send.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Put | Self::Get | Self::Delete | Self::Register | Self::Exit | Self::Status
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message incomplete after {buffered} bytes")]
    Incomplete { buffered: usize },
    #[error("corrupt message: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message stream failed: {0}")]
    Io(#[from] io::Error),
}

impl MessageError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// A single request or reply. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    method: Method,
    path: String,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: i64,
}

impl Message {
    pub fn new(method: Method, path: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            method,
            path: path.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Message without a payload.
    pub fn bare(method: Method, path: impl Into<String>) -> Self {
        Self::new(method, path, serde_json::Value::Null)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }

    /// Unix seconds at construction.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| {
            if e.is_eof() {
                MessageError::Incomplete {
                    buffered: bytes.len(),
                }
            } else {
                MessageError::Corrupt(e)
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Codec for a stream carrying self-delimiting JSON messages.
///
/// `decode` yields a message as soon as the buffered bytes hold one and leaves anything after
/// it in the buffer. A buffer that does not parse yet, corrupt or not, is kept: more bytes or
/// the end of the stream decide. At end of stream a leftover buffer is reported as
/// [`MessageError::Incomplete`] or [`MessageError::Corrupt`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec {
    _private: (),
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one message off the front of `src`, or say why there isn't one yet.
    fn take(&self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Message>();
        let message = match stream.next() {
            None => return Ok(None),
            Some(Ok(message)) => message,
            Some(Err(e)) if e.is_eof() => return Ok(None),
            Some(Err(e)) => return Err(MessageError::Corrupt(e)),
        };
        let used = stream.byte_offset();
        src.advance(used);
        Ok(Some(message))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        match self.take(src) {
            Err(e) => {
                trace!(buffered = src.len(), error = %e, "Undecodable so far, still buffering");
                Ok(None)
            }
            decoded => decoded,
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        if let Some(message) = self.take(src)? {
            return Ok(Some(message));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        Message::decode(src).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), MessageError> {
        let json = item.encode()?;
        trace!(bytes = json.len(), method = %item.method(), "Encoding message");
        dst.extend_from_slice(&json);
        Ok(())
    }
}

/// Reassembles a message delivered in arbitrary chunks.
///
/// Decoding is retried after every chunk. Once a message decodes the buffer is frozen and
/// further chunks are ignored.
#[derive(Debug, Default)]
pub struct PartialMessage {
    codec: MessageCodec,
    buffer: BytesMut,
    chunks: usize,
    received: usize,
    message: Option<Message>,
}

impl PartialMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and try to decode.
    ///
    /// Returns `Ok(true)` once the message is ready and `Ok(false)` while it is still
    /// incomplete. A corrupt buffer is reported but kept, so a caller that logs and carries
    /// on will retry with the next chunk.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<bool, MessageError> {
        if self.message.is_some() {
            return Ok(true);
        }
        self.chunks += 1;
        self.received += chunk.len();
        self.buffer.extend_from_slice(chunk);

        self.message = self.codec.take(&mut self.buffer)?;
        Ok(self.message.is_some())
    }

    pub fn is_ready(&self) -> bool {
        self.message.is_some()
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Take the decoded message, or the reason there isn't one.
    pub fn into_message(self) -> Result<Message, MessageError> {
        match self.message {
            Some(message) => Ok(message),
            None => Message::decode(&self.buffer),
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Bytes accepted before the message became ready.
    pub fn buffered(&self) -> usize {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_wire_names() {
        assert_eq!(serde_json::to_string(&Method::Put).unwrap(), "\"PUT\"");
        assert_eq!(serde_json::to_string(&Method::Welcome).unwrap(), "\"WELCOME\"");
        assert_eq!(Method::Miss.to_string(), "MISS");
        assert!(Method::Status.is_request());
        assert!(!Method::Hit.is_request());
    }

    #[test]
    fn message_wire_format() {
        let msg = Message::new(Method::Put, "/fork/42", json!({"status": "COMPLETE"}))
            .at(1_700_000_000);
        insta::assert_json_snapshot!(msg, @r#"
        {
          "method": "PUT",
          "path": "/fork/42",
          "payload": {
            "status": "COMPLETE"
          },
          "timestamp": 1700000000
        }
        "#);
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let msg = Message::decode(br#"{"method":"GET","path":"/a","timestamp":5}"#).unwrap();
        assert_eq!(msg.method(), Method::Get);
        assert_eq!(msg.payload(), &serde_json::Value::Null);
        assert_eq!(msg.timestamp(), 5);
    }

    #[test]
    fn prefix_is_incomplete_not_corrupt() {
        let bytes = Message::new(Method::Put, "/k", json!("value")).encode().unwrap();
        for cut in 0..bytes.len() {
            let err = Message::decode(&bytes[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "cut at {cut} should be incomplete: {err}");
        }
        assert!(Message::decode(&bytes).is_ok());
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = Message::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, MessageError::Corrupt(_)));

        let err = Message::decode(br#"{"method":"SHOUT","path":"/a","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, MessageError::Corrupt(_)));
    }

    #[test]
    fn partial_message_reassembles_byte_by_byte() {
        let original = Message::new(Method::Put, "/fork/7", json!({"label": "héllo wörld"}));
        let bytes = original.encode().unwrap();

        let mut partial = PartialMessage::new();
        for (i, byte) in bytes.iter().enumerate() {
            let ready = partial.add_chunk(std::slice::from_ref(byte)).unwrap();
            assert_eq!(ready, i == bytes.len() - 1);
        }

        assert!(partial.is_ready());
        assert_eq!(partial.chunks(), bytes.len());
        assert_eq!(partial.into_message().unwrap(), original);
    }

    #[test]
    fn chunks_after_ready_are_ignored() {
        let bytes = Message::bare(Method::Get, "/a").encode().unwrap();
        let mut partial = PartialMessage::new();
        assert!(partial.add_chunk(&bytes).unwrap());

        assert!(partial.add_chunk(b"trailing junk").unwrap());
        assert_eq!(partial.chunks(), 1);
        assert_eq!(partial.buffered(), bytes.len());
        assert_eq!(partial.message().unwrap().path(), "/a");
    }

    #[test]
    fn corrupt_chunk_is_reported_and_buffer_kept() {
        let mut partial = PartialMessage::new();
        assert!(partial.add_chunk(b"{\"method\":").is_ok());
        assert!(partial.add_chunk(b"42,").is_err());
        assert_eq!(partial.buffered(), 13);
        assert!(!partial.is_ready());
    }

    #[tokio::test]
    async fn framed_read_splits_back_to_back_messages() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let first = Message::new(Method::Put, "/a", json!([1, 2]));
        let second = Message::bare(Method::Get, "/a");
        let mut wire = first.encode().unwrap();
        wire.extend(second.encode().unwrap());
        wire.extend_from_slice(b"\n");

        let mut reader = FramedRead::new(&wire[..], MessageCodec::new());
        assert_eq!(reader.next().await.unwrap().unwrap(), first);
        assert_eq!(reader.next().await.unwrap().unwrap(), second);
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn framed_read_reports_truncation_at_close() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let bytes = Message::bare(Method::Get, "/a").encode().unwrap();
        let cut = &bytes[..bytes.len() - 2];
        let mut reader = FramedRead::new(cut, MessageCodec::new());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(err.is_incomplete(), "{err}");

        let mut reader = FramedRead::new(&b"{\"method\": 42}"[..], MessageCodec::new());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, MessageError::Corrupt(_)), "{err}");
    }

    #[test]
    fn encoder_writes_the_bare_json() {
        let message = Message::bare(Method::Exit, "7.0").at(3);
        let mut dst = BytesMut::new();
        MessageCodec::new().encode(message.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &message.encode().unwrap()[..]);
    }

    #[test]
    fn into_message_reports_why_not_ready() {
        let mut partial = PartialMessage::new();
        partial.add_chunk(b"{\"method\":\"GET\"").unwrap();
        assert!(partial.into_message().unwrap_err().is_incomplete());
    }
}
