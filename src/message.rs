use bytes::{Bytes, BytesMut};

/// A single message as it moves through the library.
///
/// A message is a protocol header plus a body. Protocol layers prepend
/// routing material to the header on the way down and strip it on the
/// way up; application payload lives in the body. Ownership is
/// exclusive: putting a message into a queue transfers it, and whatever
/// still sits in a queue when it closes is dropped by the queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
  header: BytesMut,
  body: BytesMut,
}

impl Message {
  pub fn new() -> Self {
    Self::default()
  }

  /// Message with the given body and an empty header. The bytes are
  /// copied; callers that already hold a `BytesMut` should use `From`.
  pub fn from_slice(body: &[u8]) -> Self {
    Message {
      header: BytesMut::new(),
      body: BytesMut::from(body),
    }
  }

  /// Body length in bytes. Header bytes do not count; this matches what
  /// the byte-oriented socket shortcuts report.
  pub fn len(&self) -> usize {
    self.body.len()
  }

  pub fn is_empty(&self) -> bool {
    self.body.is_empty()
  }

  pub fn header(&self) -> &[u8] {
    &self.header
  }

  pub fn header_mut(&mut self) -> &mut BytesMut {
    &mut self.header
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn body_mut(&mut self) -> &mut BytesMut {
    &mut self.body
  }

  /// Consumes the message, yielding the body and discarding the header.
  pub fn into_body(self) -> Bytes {
    self.body.freeze()
  }
}

impl From<BytesMut> for Message {
  fn from(body: BytesMut) -> Self {
    Message {
      header: BytesMut::new(),
      body,
    }
  }
}

impl From<Bytes> for Message {
  fn from(body: Bytes) -> Self {
    Message {
      header: BytesMut::new(),
      body: BytesMut::from(body.as_ref()),
    }
  }
}
