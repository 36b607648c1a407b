// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message payloads flowing through a pipeline.
//!
//! A [`Message`] is cheap to clone. Text and binary payloads are shared;
//! stream payloads are shared too, which means a stream can be read only
//! once across all clones until [`Message::preserve`] buffers it.

use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

type SharedReader = Arc<Mutex<Option<Box<dyn Read + Send>>>>;

#[derive(Clone, Default)]
enum Payload {
    #[default]
    Null,
    Text(Arc<str>),
    Binary(Arc<[u8]>),
    Stream(SharedReader),
}

/// A message payload: absent, text, bytes, or a one-shot stream.
#[derive(Clone, Default)]
pub struct Message {
    payload: Payload,
}

impl Message {
    /// The absent message.
    pub fn null() -> Self {
        Self::default()
    }

    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self {
            payload: Payload::Text(Arc::from(text)),
        }
    }

    /// A binary message.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            payload: Payload::Binary(Arc::from(bytes)),
        }
    }

    /// A streaming message that can be consumed once.
    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        Self {
            payload: Payload::Stream(Arc::new(Mutex::new(Some(Box::new(reader))))),
        }
    }

    /// Whether this is the absent message.
    pub fn is_null(&self) -> bool {
        matches!(self.payload, Payload::Null)
    }

    /// Whether the message is absent or has a zero-length payload.
    ///
    /// Streams are never considered empty because their length is unknown.
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            Payload::Null => true,
            Payload::Text(t) => t.is_empty(),
            Payload::Binary(b) => b.is_empty(),
            Payload::Stream(_) => false,
        }
    }

    /// Whether the payload can be read more than once.
    pub fn is_repeatable(&self) -> bool {
        !matches!(self.payload, Payload::Stream(_))
    }

    /// Payload size in bytes, when known without reading.
    pub fn size(&self) -> Option<usize> {
        match &self.payload {
            Payload::Null => Some(0),
            Payload::Text(t) => Some(t.len()),
            Payload::Binary(b) => Some(b.len()),
            Payload::Stream(_) => None,
        }
    }

    /// Buffer a stream payload so it can be read repeatedly.
    ///
    /// No-op for repeatable payloads.
    pub fn preserve(&mut self) -> io::Result<()> {
        if let Payload::Stream(reader) = &self.payload {
            let bytes = drain(reader)?;
            self.payload = Payload::Binary(Arc::from(bytes));
        }
        Ok(())
    }

    /// Read the payload as bytes. Consumes a stream payload.
    pub fn as_bytes(&self) -> io::Result<Vec<u8>> {
        match &self.payload {
            Payload::Null => Ok(Vec::new()),
            Payload::Text(t) => Ok(t.as_bytes().to_vec()),
            Payload::Binary(b) => Ok(b.to_vec()),
            Payload::Stream(reader) => drain(reader),
        }
    }

    /// Read the payload as text, replacing invalid UTF-8. Consumes a stream payload.
    pub fn as_string(&self) -> io::Result<String> {
        match &self.payload {
            Payload::Text(t) => Ok(t.to_string()),
            _ => Ok(String::from_utf8_lossy(&self.as_bytes()?).into_owned()),
        }
    }

    /// Text view of a text payload without copying.
    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) => Some(t.as_ref()),
            _ => None,
        }
    }
}

fn drain(reader: &SharedReader) -> io::Result<Vec<u8>> {
    let mut guard = reader
        .lock()
        .map_err(|_| io::Error::other("message stream lock poisoned"))?;
    let mut bytes = Vec::new();
    match guard.take() {
        Some(mut r) => {
            r.read_to_end(&mut bytes)?;
            Ok(bytes)
        }
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "message stream has already been consumed",
        )),
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::text(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::binary(bytes)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Null => f.write_str("Message(null)"),
            Payload::Text(t) => write!(f, "Message(text, {} bytes)", t.len()),
            Payload::Binary(b) => write!(f, "Message(binary, {} bytes)", b.len()),
            Payload::Stream(_) => f.write_str("Message(stream)"),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Null => f.write_str("null"),
            Payload::Text(t) => f.write_str(t),
            Payload::Binary(b) => write!(f, "<binary {} bytes>", b.len()),
            Payload::Stream(_) => f.write_str("<stream>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_and_null() {
        assert!(Message::null().is_empty());
        assert!(Message::null().is_null());
        assert!(Message::text("").is_empty());
        assert!(!Message::text("").is_null());
        assert!(Message::binary(Vec::new()).is_empty());
        assert!(!Message::text("x").is_empty());
        assert!(!Message::stream(Cursor::new(Vec::<u8>::new())).is_empty());
    }

    #[test]
    fn test_stream_is_read_once_across_clones() {
        let message = Message::stream(Cursor::new(b"payload".to_vec()));
        let clone = message.clone();

        assert_eq!(message.as_string().unwrap(), "payload");
        let err = clone.as_bytes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_preserve_makes_stream_repeatable() {
        let mut message = Message::stream(Cursor::new(b"payload".to_vec()));
        assert!(!message.is_repeatable());
        assert_eq!(message.size(), None);

        message.preserve().unwrap();

        assert!(message.is_repeatable());
        assert_eq!(message.size(), Some(7));
        let clone = message.clone();
        assert_eq!(message.as_string().unwrap(), "payload");
        assert_eq!(clone.as_string().unwrap(), "payload");
    }

    #[test]
    fn test_display() {
        assert_eq!(Message::text("hello").to_string(), "hello");
        assert_eq!(Message::null().to_string(), "null");
        assert_eq!(Message::binary(vec![1, 2, 3]).to_string(), "<binary 3 bytes>");
    }
}
