// Bounded message queue. These operate in some respects like Go
// channels, with differences that the protocol layers depend on: either
// side can close, capacity can change at runtime, a consumer can push a
// message back for redelivery, and readiness changes are fanned out to
// a registered callback without holding the queue lock.

use std::{
  fmt,
  sync::{Arc, Condvar, Mutex},
  thread,
};

use enumflags2::{bitflags, BitFlags};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::assert_impl_all;

use crate::{
  error::{Error, Result},
  message::Message,
  signal::SignalToken,
  timing::Deadline,
};

/// Level-triggered readiness bits reported to a queue's notifier.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
  /// The queue has room for another put, or it is unbuffered and a
  /// reader is waiting to be matched.
  CanPut = 0b01,
  /// The queue holds at least one message, or it is unbuffered and a
  /// writer is waiting to be matched.
  CanGet = 0b10,
}

/// A failed put hands the message back, so the caller can retry it,
/// stash it, or drop it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PutError {
  pub error: Error,
  pub message: Message,
}

impl PutError {
  fn new(error: Error, message: Message) -> Self {
    PutError { error, message }
  }

  pub fn into_message(self) -> Message {
    self.message
  }
}

type ReadinessCallback = dyn Fn(BitFlags<Ready>) + Send + Sync;

struct QueueState {
  // Ring of cap + 2 cells. One extra cell lets an unbuffered put
  // transit the ring while a matched reader is present; the other is
  // reserved for putback. Indices are modulo ring.len(), which may
  // exceed cap + 2 after a shrinking resize.
  ring: Vec<Option<Message>>,
  cap: usize,
  get: usize,
  put: usize,
  len: usize,
  closed: bool,
  put_err: Option<Error>,
  get_err: Option<Error>,
  rwait: bool,
  wwait: bool,
  notify_sig: BitFlags<Ready>,
  notify_fn: Option<Arc<ReadinessCallback>>,
}

impl QueueState {
  // Caller must hold the queue lock.
  fn kick(&mut self, notify_cv: &Condvar, sig: BitFlags<Ready>) {
    if self.notify_fn.is_some() {
      self.notify_sig |= sig;
      notify_cv.notify_one();
    }
  }

  fn drop_queued(&mut self) -> usize {
    let mut dropped = 0;
    while self.len > 0 {
      let slot = self.get;
      self.ring[slot] = None;
      self.get = (self.get + 1) % self.ring.len();
      self.len -= 1;
      dropped += 1;
    }
    dropped
  }
}

struct QueueCore {
  state: Mutex<QueueState>,
  readable: Condvar,
  writable: Condvar,
  drained: Condvar,
  notify_cv: Condvar,
}

/// Bounded FIFO of [`Message`]s shared between protocol and transport
/// threads.
///
/// All blocking entry points take an absolute [`Deadline`] and may also
/// be aborted through a [`SignalToken`]. A queue owns the messages
/// inside it: whatever is still queued when the queue closes is
/// dropped.
pub struct MsgQueue {
  core: Arc<QueueCore>,
  // Readiness notifier worker; started lazily by `notify`, joined on
  // drop. Acquired before the state lock, never after it.
  worker: Mutex<Option<thread::JoinHandle<()>>>,
}

assert_impl_all!(MsgQueue: Send, Sync);

impl MsgQueue {
  /// Queue holding up to `cap` messages (plus the reserved putback
  /// cell). `cap == 0` gives rendezvous semantics: a put completes only
  /// when a reader is waiting for it.
  pub fn with_capacity(cap: usize) -> Result<MsgQueue> {
    let alloc = cap + 2;
    let mut ring: Vec<Option<Message>> = Vec::new();
    ring
      .try_reserve_exact(alloc)
      .map_err(|_| Error::OutOfMemory)?;
    ring.resize_with(alloc, || None);
    Ok(MsgQueue {
      core: Arc::new(QueueCore {
        state: Mutex::new(QueueState {
          ring,
          cap,
          get: 0,
          put: 0,
          len: 0,
          closed: false,
          put_err: None,
          get_err: None,
          rwait: false,
          wwait: false,
          notify_sig: BitFlags::empty(),
          notify_fn: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        drained: Condvar::new(),
        notify_cv: Condvar::new(),
      }),
      worker: Mutex::new(None),
    })
  }

  /// Rendezvous queue, equivalent to `with_capacity(0)`.
  pub fn unbuffered() -> Result<MsgQueue> {
    Self::with_capacity(0)
  }

  pub fn len(&self) -> usize {
    self.core.state.lock().unwrap().len
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.core.state.lock().unwrap().cap
  }

  pub fn is_closed(&self) -> bool {
    self.core.state.lock().unwrap().closed
  }

  /// Blocking put.
  pub fn put(&self, msg: Message) -> std::result::Result<(), PutError> {
    self.do_put(msg, Deadline::Never, None)
  }

  /// Non-blocking put; fails [`Error::Again`] when the queue is full.
  pub fn try_put(&self, msg: Message) -> std::result::Result<(), PutError> {
    self.do_put(msg, Deadline::Now, None)
  }

  /// Put with an absolute deadline.
  pub fn put_until(&self, msg: Message, deadline: Deadline) -> std::result::Result<(), PutError> {
    self.do_put(msg, deadline, None)
  }

  /// Blocking put that can be aborted by raising `sig` and waking the
  /// queue (see [`MsgQueue::signal`]).
  pub fn put_sig(&self, msg: Message, sig: &SignalToken) -> std::result::Result<(), PutError> {
    self.do_put(msg, Deadline::Never, Some(sig))
  }

  /// Blocking get.
  pub fn get(&self) -> Result<Message> {
    self.do_get(Deadline::Never, None)
  }

  /// Non-blocking get; fails [`Error::Again`] when the queue is empty.
  pub fn try_get(&self) -> Result<Message> {
    self.do_get(Deadline::Now, None)
  }

  /// Get with an absolute deadline.
  pub fn get_until(&self, deadline: Deadline) -> Result<Message> {
    self.do_get(deadline, None)
  }

  /// Blocking get that can be aborted by raising `sig` and waking the
  /// queue (see [`MsgQueue::signal`]).
  pub fn get_sig(&self, sig: &SignalToken) -> Result<Message> {
    self.do_get(Deadline::Never, Some(sig))
  }

  fn do_put(
    &self,
    msg: Message,
    deadline: Deadline,
    sig: Option<&SignalToken>,
  ) -> std::result::Result<(), PutError> {
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    loop {
      let st = &mut *guard;
      // No put ever succeeds on a closed queue, even if there is room.
      if st.closed {
        return Err(PutError::new(Error::Closed, msg));
      }
      if let Some(e) = st.put_err {
        return Err(PutError::new(e, msg));
      }
      if st.len < st.cap {
        break;
      }
      // Unbuffered hand-off: the matched reader will pop immediately.
      if st.rwait && st.cap == 0 && st.len == 0 {
        break;
      }
      if sig.is_some_and(SignalToken::is_raised) {
        return Err(PutError::new(Error::Interrupted, msg));
      }
      if deadline.is_now() {
        return Err(PutError::new(Error::Again, msg));
      }
      st.wwait = true;
      if st.cap == 0 {
        // A reader arriving now could be matched at once.
        st.kick(&core.notify_cv, Ready::CanGet.into());
      }
      let (reacquired, timed_out) = deadline.wait_on(&core.writable, guard);
      guard = reacquired;
      if timed_out {
        return Err(PutError::new(Error::TimedOut, msg));
      }
    }

    let st = &mut *guard;
    let slot = st.put;
    st.ring[slot] = Some(msg);
    st.put = (st.put + 1) % st.ring.len();
    st.len += 1;
    if st.rwait {
      st.rwait = false;
      core.readable.notify_all();
    }
    let mut ready: BitFlags<Ready> = Ready::CanGet.into();
    if st.len < st.cap {
      ready |= Ready::CanPut;
    }
    st.kick(&core.notify_cv, ready);
    Ok(())
  }

  fn do_get(&self, deadline: Deadline, sig: Option<&SignalToken>) -> Result<Message> {
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    loop {
      let st = &mut *guard;
      // Always prefer delivery: a closed queue still drains.
      if st.len != 0 {
        break;
      }
      if st.closed {
        return Err(Error::Closed);
      }
      if let Some(e) = st.get_err {
        return Err(e);
      }
      if deadline.is_now() {
        return Err(Error::Again);
      }
      if sig.is_some_and(SignalToken::is_raised) {
        return Err(Error::Interrupted);
      }
      if st.cap == 0 && st.wwait {
        // Let a writer know a rendezvous is now possible.
        st.wwait = false;
        core.writable.notify_all();
      }
      st.rwait = true;
      if st.cap == 0 {
        st.kick(&core.notify_cv, Ready::CanPut.into());
      }
      let (reacquired, timed_out) = deadline.wait_on(&core.readable, guard);
      guard = reacquired;
      if timed_out {
        return Err(Error::TimedOut);
      }
    }

    let st = &mut *guard;
    let msg = st.ring[st.get].take().expect("message in occupied ring slot");
    st.get = (st.get + 1) % st.ring.len();
    st.len -= 1;
    if st.wwait {
      st.wwait = false;
      core.writable.notify_all();
    }
    if st.closed && st.len == 0 {
      core.drained.notify_all();
    }
    let mut ready: BitFlags<Ready> = Ready::CanPut.into();
    if st.len > 0 {
      ready |= Ready::CanGet;
    }
    st.kick(&core.notify_cv, ready);
    Ok(msg)
  }

  /// Places `msg` at the head of the queue, so the next get returns it
  /// before anything older. Never blocks: one reserved cell guarantees
  /// room even at full capacity. Fails [`Error::Closed`] on a closed
  /// queue, and [`Error::Again`] if the reserved cell is already in
  /// use.
  pub fn putback(&self, msg: Message) -> std::result::Result<(), PutError> {
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    let st = &mut *guard;
    if st.closed {
      return Err(PutError::new(Error::Closed, msg));
    }
    if st.len > st.cap {
      return Err(PutError::new(Error::Again, msg));
    }
    let alloc = st.ring.len();
    st.get = (st.get + alloc - 1) % alloc;
    let slot = st.get;
    st.ring[slot] = Some(msg);
    st.len += 1;
    if st.rwait {
      st.rwait = false;
      core.readable.notify_all();
    }
    st.kick(&core.notify_cv, Ready::CanGet.into());
    Ok(())
  }

  /// Closes the queue and drops everything still inside it. Waiters
  /// wake and observe [`Error::Closed`]. Idempotent.
  pub fn close(&self) {
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    let st = &mut *guard;
    st.closed = true;
    st.rwait = false;
    st.wwait = false;
    let dropped = st.drop_queued();
    if dropped > 0 {
      debug!("close dropped {dropped} undelivered message(s)");
    }
    core.readable.notify_all();
    core.writable.notify_all();
    core.drained.notify_all();
    core.notify_cv.notify_all();
  }

  /// Graceful close: producers observe [`Error::Closed`] immediately,
  /// while consumers keep draining. Blocks until the queue is empty or
  /// `deadline` fires, then drops whatever remains. The queue is closed
  /// when this returns.
  pub fn drain(&self, deadline: Deadline) {
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    {
      let st = &mut *guard;
      st.closed = true;
      st.rwait = false;
      st.wwait = false;
    }
    core.readable.notify_all();
    core.writable.notify_all();
    core.notify_cv.notify_all();
    while guard.len > 0 {
      let (reacquired, timed_out) = deadline.wait_on(&core.drained, guard);
      guard = reacquired;
      if timed_out {
        break;
      }
    }
    let st = &mut *guard;
    let dropped = st.drop_queued();
    if dropped > 0 {
      debug!("drain deadline passed with {dropped} message(s) still queued; dropping");
    }
    core.drained.notify_all();
  }

  /// Installs a sticky error for producers: every put fails with
  /// `error` until it is cleared with `None`.
  pub fn set_put_error(&self, error: Option<Error>) {
    let mut guard = self.core.state.lock().unwrap();
    guard.put_err = error;
    if error.is_some() {
      guard.wwait = false;
      self.core.writable.notify_all();
    }
  }

  /// Installs a sticky error for consumers: every get fails with
  /// `error` until it is cleared with `None`.
  pub fn set_get_error(&self, error: Option<Error>) {
    let mut guard = self.core.state.lock().unwrap();
    guard.get_err = error;
    if error.is_some() {
      guard.rwait = false;
      self.core.readable.notify_all();
    }
  }

  /// Installs a sticky error on both directions at once.
  pub fn set_error(&self, error: Option<Error>) {
    let mut guard = self.core.state.lock().unwrap();
    guard.put_err = error;
    guard.get_err = error;
    if error.is_some() {
      guard.rwait = false;
      guard.wwait = false;
      self.core.readable.notify_all();
      self.core.writable.notify_all();
    }
  }

  /// Raises `token` and wakes every waiter on this queue, so that calls
  /// passed that token abort with [`Error::Interrupted`]. The token
  /// must be cleared again before reuse.
  pub fn signal(&self, token: &SignalToken) {
    let mut guard = self.core.state.lock().unwrap();
    token.raise();
    guard.rwait = false;
    guard.wwait = false;
    self.core.readable.notify_all();
    self.core.writable.notify_all();
    self.core.notify_cv.notify_all();
  }

  /// Changes the capacity. When shrinking, the oldest messages beyond
  /// the new bound are dropped first. Every waiter is woken so it can
  /// re-evaluate against the new capacity.
  pub fn resize(&self, cap: usize) -> Result<()> {
    let alloc = cap + 2;
    let core = &*self.core;
    let mut guard = core.state.lock().unwrap();
    let st = &mut *guard;

    let mut dropped = 0;
    while st.len > cap + 1 {
      let slot = st.get;
      st.ring[slot] = None;
      st.get = (st.get + 1) % st.ring.len();
      st.len -= 1;
      dropped += 1;
    }
    if dropped > 0 {
      debug!("resize to capacity {cap} dropped {dropped} oldest message(s)");
    }

    if alloc > st.ring.len() {
      let mut ring: Vec<Option<Message>> = Vec::new();
      ring
        .try_reserve_exact(alloc)
        .map_err(|_| Error::OutOfMemory)?;
      ring.resize_with(alloc, || None);
      let old_alloc = st.ring.len();
      let mut src = st.get;
      for slot in ring.iter_mut().take(st.len) {
        *slot = st.ring[src].take();
        src = (src + 1) % old_alloc;
      }
      st.ring = ring;
      st.get = 0;
      st.put = st.len;
    }
    // A shrinking resize keeps the larger ring; indices stay modulo
    // ring.len().
    st.cap = cap;

    core.readable.notify_all();
    core.writable.notify_all();
    core.drained.notify_all();
    Ok(())
  }

  /// Registers the readiness callback and starts the notifier worker on
  /// first registration. Registration replaces any previous callback
  /// (single-writer semantics); concurrent registrations are serialised
  /// by the queue lock and the last one wins.
  ///
  /// The callback runs on the notifier worker with no queue lock held.
  /// It must not call back into this queue synchronously in a way that
  /// blocks forever, but it may freely use other queues and sockets.
  /// Readiness is level-triggered: each put/get kicks whenever the
  /// condition holds, not only on an edge, so a callback registered on
  /// an already-ready queue fires during the next put/get.
  pub fn notify<F>(&self, callback: F) -> Result<()>
  where
    F: Fn(BitFlags<Ready>) + Send + Sync + 'static,
  {
    let mut worker = self.worker.lock().unwrap();
    {
      let mut guard = self.core.state.lock().unwrap();
      if guard.closed {
        return Err(Error::Closed);
      }
      guard.notify_fn = Some(Arc::new(callback));
    }
    if worker.is_none() {
      let core = Arc::clone(&self.core);
      let handle = thread::Builder::new()
        .name("mq-notifier".into())
        .spawn(move || notifier_loop(&core))
        .map_err(|_| Error::OutOfMemory)?;
      *worker = Some(handle);
    }
    Ok(())
  }

  /// Registers a callback fired only when the queue becomes writable.
  pub fn notify_canput<F>(&self, callback: F) -> Result<()>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.notify(move |sig| {
      if sig.contains(Ready::CanPut) {
        callback();
      }
    })
  }

  /// Registers a callback fired only when the queue becomes readable.
  pub fn notify_canget<F>(&self, callback: F) -> Result<()>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.notify(move |sig| {
      if sig.contains(Ready::CanGet) {
        callback();
      }
    })
  }
}

impl fmt::Debug for MsgQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let guard = self.core.state.lock().unwrap();
    f.debug_struct("MsgQueue")
      .field("cap", &guard.cap)
      .field("len", &guard.len)
      .field("closed", &guard.closed)
      .finish_non_exhaustive()
  }
}

impl Drop for MsgQueue {
  fn drop(&mut self) {
    self.close();
    let worker = self.worker.lock().unwrap().take();
    if let Some(handle) = worker {
      if handle.join().is_err() {
        error!("message queue notifier worker panicked");
      }
    }
  }
}

// Runs readiness callbacks outside the queue lock. Exits once the
// queue closes.
fn notifier_loop(core: &QueueCore) {
  trace!("queue notifier worker running");
  let mut guard = core.state.lock().unwrap();
  loop {
    while guard.notify_sig.is_empty() && !guard.closed {
      guard = core.notify_cv.wait(guard).unwrap();
    }
    if guard.closed {
      break;
    }
    let sig = guard.notify_sig;
    guard.notify_sig = BitFlags::empty();
    let callback = guard.notify_fn.clone();
    drop(guard);
    if let Some(callback) = callback {
      callback(sig);
    }
    guard = core.state.lock().unwrap();
  }
  drop(guard);
  trace!("queue notifier worker exiting");
}
