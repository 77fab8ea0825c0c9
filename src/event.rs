// Socket events and their delivery plumbing.
//
// An Event is a small completion object: whoever submits it can block
// until the socket's delivery worker has run every interested listener
// callback. Listeners subscribe with a mask; readiness listeners carry
// an embedded Event that the queue trampolines re-submit, so readiness
// stays level-triggered without ever queueing duplicates.

use std::{
  collections::VecDeque,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, Weak,
  },
  task::{Context, Poll, Waker},
};

use enumflags2::{bitflags, BitFlags};
use futures::stream::{FusedStream, Stream};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::Error,
  global::{EndpointId, PipeId, SocketId},
  socket::SocketCore,
};

/// Kinds of asynchronous socket events a listener can subscribe to.
///
/// A listener's interest mask may OR several kinds together to receive
/// any of them.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  /// The socket can accept a send without blocking.
  CanSend = 0x01,
  /// The socket has a message ready to receive.
  CanRecv = 0x02,
  /// A pipe (established connection) was attached.
  PipeAdded = 0x04,
  /// A pipe was detached.
  PipeRemoved = 0x08,
  /// An endpoint (dialer or listener) was added.
  EndpointAdded = 0x10,
  /// An endpoint was removed.
  EndpointRemoved = 0x20,
  /// The socket reported an asynchronous error.
  SocketError = 0x40,
}

/// What a listener callback sees for one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
  /// Event kind(s). For readiness events synthesised on behalf of a
  /// listener this is the listener's own interest mask.
  pub kind: BitFlags<EventKind>,
  pub socket: SocketId,
  pub endpoint: Option<EndpointId>,
  pub pipe: Option<PipeId>,
  /// Populated for [`EventKind::SocketError`] events.
  pub error: Option<Error>,
}

/// A submittable completion object.
///
/// `pending` and `done` are only ever mutated while holding the owning
/// socket's state lock; they are atomics so the object itself stays
/// `Sync` without a lock of its own. The condition variable pairs with
/// that same socket lock for its whole life.
#[derive(Debug)]
pub struct Event {
  pub(crate) info: EventInfo,
  pub(crate) pending: AtomicBool,
  pub(crate) done: AtomicBool,
  pub(crate) cv: Condvar,
}

impl Event {
  pub fn new(kind: impl Into<BitFlags<EventKind>>, socket: SocketId) -> Event {
    Event {
      info: EventInfo {
        kind: kind.into(),
        socket,
        endpoint: None,
        pipe: None,
        error: None,
      },
      pending: AtomicBool::new(false),
      // An event that was never submitted is vacuously complete, so a
      // wait on it returns at once.
      done: AtomicBool::new(true),
      cv: Condvar::new(),
    }
  }

  pub fn with_pipe(mut self, pipe: PipeId) -> Event {
    self.info.pipe = Some(pipe);
    self
  }

  pub fn with_endpoint(mut self, endpoint: EndpointId) -> Event {
    self.info.endpoint = Some(endpoint);
    self
  }

  pub fn with_error(mut self, error: Error) -> Event {
    self.info.error = Some(error);
    self
  }

  pub fn info(&self) -> &EventInfo {
    &self.info
  }

  /// True when no submission is outstanding: every interested listener
  /// has run for the most recent submission, or the event was never
  /// submitted at all.
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::SeqCst)
  }
}

pub(crate) type ListenerFn = dyn Fn(&EventInfo) + Send + Sync;

/// One registered notify listener: interest mask, callback, and the
/// embedded event used to synthesise readiness deliveries.
pub(crate) struct Listener {
  pub(crate) mask: BitFlags<EventKind>,
  pub(crate) func: Box<ListenerFn>,
  pub(crate) event: Arc<Event>,
}

/// Handle returned by [`Socket::add_notify`](crate::socket::Socket::add_notify);
/// pass it back to `remove_notify` to unregister.
pub struct NotifyHandle {
  pub(crate) listener: Arc<Listener>,
}

// ----------------------------------------------
// ----------------------------------------------

// Async adapter: a listener that parks delivered events in a queue and
// wakes a stored task waker, so socket events can be consumed as a
// futures Stream.

pub(crate) struct StreamShared {
  pub(crate) queue: Mutex<VecDeque<EventInfo>>,
  pub(crate) waker: Mutex<Option<Waker>>,
}

impl StreamShared {
  // Runs on the delivery worker.
  pub(crate) fn push(&self, info: &EventInfo) {
    self.queue.lock().unwrap().push_back(info.clone());
    let waker = self.waker.lock().unwrap().take();
    if let Some(w) = waker {
      w.wake();
    }
  }
}

/// Async stream of [`EventInfo`] for one interest mask, created by
/// [`Socket::event_stream`](crate::socket::Socket::event_stream).
///
/// The stream terminates once its socket has closed and every already
/// delivered event has been consumed. Dropping the stream unregisters
/// its listener.
pub struct EventStream {
  pub(crate) shared: Arc<StreamShared>,
  pub(crate) socket: Weak<SocketCore>,
  pub(crate) handle: Option<NotifyHandle>,
  pub(crate) terminated: AtomicBool,
}

impl Stream for EventStream {
  type Item = EventInfo;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    // Take the waker slot first, so a delivery between our emptiness
    // check and the waker store cannot be lost.
    let mut waker_slot = self.shared.waker.lock().unwrap();
    if let Some(info) = self.shared.queue.lock().unwrap().pop_front() {
      return Poll::Ready(Some(info));
    }
    let socket_gone = match self.socket.upgrade() {
      Some(core) => core.is_closing(),
      None => true,
    };
    if socket_gone {
      self.terminated.store(true, Ordering::SeqCst);
      return Poll::Ready(None);
    }
    *waker_slot = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl FusedStream for EventStream {
  fn is_terminated(&self) -> bool {
    self.terminated.load(Ordering::SeqCst)
  }
}

impl Drop for EventStream {
  fn drop(&mut self) {
    if let (Some(handle), Some(core)) = (self.handle.take(), self.socket.upgrade()) {
      core.remove_notify(handle);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_are_distinct_bits() {
    let all: BitFlags<EventKind> = BitFlags::all();
    assert_eq!(all.iter().count(), 7);
    assert!(all.contains(EventKind::CanSend | EventKind::SocketError));
  }

  #[test]
  fn builders_fill_identities() {
    let ev = Event::new(EventKind::PipeAdded, SocketId(7)).with_pipe(PipeId(3));
    assert_eq!(ev.info().socket, SocketId(7));
    assert_eq!(ev.info().pipe, Some(PipeId(3)));
    assert_eq!(ev.info().endpoint, None);
    // Never submitted, so a completion wait would not block.
    assert!(ev.is_done());
  }

  #[test]
  fn mask_matching_uses_any_overlap() {
    let mask = EventKind::CanRecv | EventKind::PipeRemoved;
    assert!(mask.intersects(EventKind::CanRecv | EventKind::CanSend));
    assert!(!mask.intersects(BitFlags::from_flag(EventKind::CanSend)));
  }
}
