// The per-socket event bus and the user-facing send/recv surface.
//
// A socket owns two message queues (the upper write and read queues
// that protocol glue drains and fills), a list of notify listeners,
// and one delivery worker that serialises event delivery. Two locks
// guard the socket: the state lock (event queue, closing flag) and the
// listener-list lock. The state lock is always acquired first;
// listener callbacks run holding only the listener-list lock, so they
// may re-enter send/recv and submission paths.

use std::{
  collections::VecDeque,
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
  },
  thread,
  time::Duration,
};

use bytes::Bytes;
use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_assertions::assert_impl_all;

use crate::{
  error::{Error, Result},
  event::{Event, EventInfo, EventKind, EventStream, Listener, ListenerFn, NotifyHandle, StreamShared},
  global::{self, EndpointId, PipeId, SocketId},
  message::Message,
  msgqueue::{MsgQueue, PutError},
  signal::SignalToken,
  timing::Deadline,
};

/// Tunables a socket is created with. Buffer sizes count messages, not
/// bytes. A timeout of `None` blocks forever; `Some(ZERO)` never
/// blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
  pub send_buffer: usize,
  pub recv_buffer: usize,
  pub send_timeout: Option<Duration>,
  pub recv_timeout: Option<Duration>,
}

impl Default for SocketOptions {
  fn default() -> Self {
    SocketOptions {
      send_buffer: 8,
      recv_buffer: 8,
      send_timeout: None,
      recv_timeout: None,
    }
  }
}

struct SockState {
  events: VecDeque<Arc<Event>>,
  closing: bool,
  worker: Option<thread::JoinHandle<()>>,
}

pub(crate) struct SocketCore {
  id: SocketId,
  state: Mutex<SockState>,
  // Paired with `state` for its whole life.
  notify_cv: Condvar,
  // Never acquired before `state` is released or while it is wanted.
  listeners: Mutex<Vec<Arc<Listener>>>,
  // Mirror of listeners.len(); lets the submission path skip dead
  // sockets without touching the listener-list lock, which the
  // delivery worker holds while callbacks run.
  listener_count: AtomicUsize,
  uwq: Arc<MsgQueue>,
  urq: Arc<MsgQueue>,
  options: Mutex<SocketOptions>,
  // Number of live user-facing Socket handles; the last one to drop
  // closes the socket.
  user_handles: AtomicUsize,
}

impl SocketCore {
  pub(crate) fn id(&self) -> SocketId {
    self.id
  }

  pub(crate) fn is_closing(&self) -> bool {
    self.state.lock().unwrap().closing
  }

  // Queues `event` for delivery. Completes it on the spot when nobody
  // is listening or the socket is closing, so a submitter can never
  // block on a worker that will not run.
  fn submit(&self, event: &Arc<Event>) {
    let mut st = self.state.lock().unwrap();
    if st.closing || self.listener_count.load(Ordering::SeqCst) == 0 {
      complete(event);
      return;
    }
    Self::submit_locked(&mut st, &self.notify_cv, event);
  }

  // Caller holds the state lock. Re-submission while pending is
  // idempotent: the event is queued at most once.
  fn submit_locked(st: &mut MutexGuard<'_, SockState>, notify_cv: &Condvar, event: &Arc<Event>) {
    if !event.pending.load(Ordering::SeqCst) {
      event.pending.store(true, Ordering::SeqCst);
      event.done.store(false, Ordering::SeqCst);
      st.events.push_back(Arc::clone(event));
      notify_cv.notify_one();
    }
  }

  // Blocks until the most recent submission of `event` has been
  // delivered to every interested listener. `done` alone is the
  // barrier: it goes false at submission and true only after delivery,
  // so a spurious wake mid-delivery (pending already cleared) cannot
  // slip through.
  fn wait(&self, event: &Event) {
    let mut st = self.state.lock().unwrap();
    while !event.done.load(Ordering::SeqCst) {
      st = event.cv.wait(st).unwrap();
    }
    drop(st);
  }

  // Readiness trampoline target, invoked from a queue's notifier
  // worker. Submits the embedded event of every listener interested in
  // `kind`; user callbacks then run on this socket's delivery worker,
  // never on the queue notifier thread.
  fn queue_readiness(&self, kind: EventKind) {
    let mut st = self.state.lock().unwrap();
    if st.closing {
      return;
    }
    let listeners = self.listeners.lock().unwrap();
    for listener in listeners.iter() {
      if listener.mask.contains(kind) {
        Self::submit_locked(&mut st, &self.notify_cv, &listener.event);
      }
    }
  }

  pub(crate) fn add_notify(&self, mask: BitFlags<EventKind>, func: Box<ListenerFn>) -> NotifyHandle {
    let listener = Arc::new(Listener {
      mask,
      func,
      event: Arc::new(Event::new(mask, self.id)),
    });
    let mut listeners = self.listeners.lock().unwrap();
    listeners.push(Arc::clone(&listener));
    self
      .listener_count
      .store(listeners.len(), Ordering::SeqCst);
    NotifyHandle { listener }
  }

  pub(crate) fn remove_notify(&self, handle: NotifyHandle) {
    {
      // Blocks while the worker is mid-iteration, so the callback has
      // quiesced once we return.
      let mut listeners = self.listeners.lock().unwrap();
      listeners.retain(|l| !Arc::ptr_eq(l, &handle.listener));
      self
        .listener_count
        .store(listeners.len(), Ordering::SeqCst);
    }
    // Withdraw its readiness event if still queued, and release anyone
    // waiting on it.
    let mut st = self.state.lock().unwrap();
    st.events.retain(|e| !Arc::ptr_eq(e, &handle.listener.event));
    complete(&handle.listener.event);
    drop(st);
  }

  pub(crate) fn close(&self) {
    {
      let mut st = self.state.lock().unwrap();
      if st.closing {
        return;
      }
      st.closing = true;
      // Complete everything still queued so submitters do not hang.
      for event in st.events.drain(..) {
        complete(&event);
      }
      self.notify_cv.notify_all();
    }
    self.uwq.close();
    self.urq.close();
    let worker = self.state.lock().unwrap().worker.take();
    if let Some(handle) = worker {
      // A callback may close its own socket, in which case we are the
      // worker and it is about to exit on its own.
      if handle.thread().id() != thread::current().id() && handle.join().is_err() {
        error!("socket {} event worker panicked", self.id);
      }
    }
    global::unregister_socket(self.id);
    debug!("socket {} closed", self.id);
  }
}

fn complete(event: &Event) {
  event.pending.store(false, Ordering::SeqCst);
  event.done.store(true, Ordering::SeqCst);
  event.cv.notify_all();
}

// Delivery worker: pops events head-first and runs every listener
// whose mask overlaps the event's kind, without holding the state
// lock. Exits when the socket starts closing.
fn notifier(core: &Arc<SocketCore>) {
  trace!("socket {} event worker running", core.id);
  let mut st = core.state.lock().unwrap();
  loop {
    if st.closing {
      break;
    }
    if let Some(event) = st.events.pop_front() {
      event.pending.store(false, Ordering::SeqCst);
      drop(st);
      {
        // The listener set must not mutate mid-iteration.
        let listeners = core.listeners.lock().unwrap();
        for listener in listeners.iter() {
          if listener.mask.intersects(event.info.kind) {
            (listener.func)(&event.info);
          }
        }
      }
      st = core.state.lock().unwrap();
      complete(&event);
      continue;
    }
    st = core.notify_cv.wait(st).unwrap();
  }
  drop(st);
  trace!("socket {} event worker exiting", core.id);
}

/// A protocol socket's core: message queues toward the protocol layer
/// plus asynchronous event delivery toward the application.
///
/// `Socket` is a cheap clone of a shared handle. The socket closes when
/// [`close`](Socket::close) is called or the last handle drops,
/// whichever comes first; both queues close, all waiters wake with
/// [`Error::Closed`], and the worker threads are joined.
pub struct Socket {
  core: Arc<SocketCore>,
}

assert_impl_all!(Socket: Send, Sync);

impl Socket {
  /// Socket with default options.
  pub fn open() -> Result<Socket> {
    Self::with_options(SocketOptions::default())
  }

  pub fn with_options(options: SocketOptions) -> Result<Socket> {
    let id = global::next_socket_id();
    let uwq = Arc::new(MsgQueue::with_capacity(options.send_buffer)?);
    let urq = Arc::new(MsgQueue::with_capacity(options.recv_buffer)?);
    let core = Arc::new(SocketCore {
      id,
      state: Mutex::new(SockState {
        events: VecDeque::new(),
        closing: false,
        worker: None,
      }),
      notify_cv: Condvar::new(),
      listeners: Mutex::new(Vec::new()),
      uwq,
      urq,
      options: Mutex::new(options),
      listener_count: AtomicUsize::new(0),
      user_handles: AtomicUsize::new(1),
    });

    // Readiness hookup: the queue notifier threads only submit events;
    // user callbacks always run on the delivery worker.
    let weak = Arc::downgrade(&core);
    core.uwq.notify_canput(move || {
      if let Some(core) = weak.upgrade() {
        core.queue_readiness(EventKind::CanSend);
      }
    })?;
    let weak = Arc::downgrade(&core);
    core.urq.notify_canget(move || {
      if let Some(core) = weak.upgrade() {
        core.queue_readiness(EventKind::CanRecv);
      }
    })?;

    let worker = thread::Builder::new()
      .name(format!("socket-{id}-events"))
      .spawn({
        let core = Arc::clone(&core);
        move || notifier(&core)
      })
      .map_err(|_| Error::OutOfMemory)?;
    core.state.lock().unwrap().worker = Some(worker);

    global::register_socket(&core);
    debug!("socket {id} open");
    Ok(Socket { core })
  }

  pub(crate) fn from_core(core: Arc<SocketCore>) -> Socket {
    core.user_handles.fetch_add(1, Ordering::SeqCst);
    Socket { core }
  }

  pub fn id(&self) -> SocketId {
    self.core.id
  }

  /// The upper write queue: protocol glue pops what the application
  /// sends from here.
  pub fn send_queue(&self) -> &Arc<MsgQueue> {
    &self.core.uwq
  }

  /// The upper read queue: protocol glue pushes inbound messages here
  /// for the application to receive.
  pub fn recv_queue(&self) -> &Arc<MsgQueue> {
    &self.core.urq
  }

  pub fn options(&self) -> SocketOptions {
    self.core.options.lock().unwrap().clone()
  }

  pub fn set_send_timeout(&self, timeout: Option<Duration>) {
    self.core.options.lock().unwrap().send_timeout = timeout;
  }

  pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
    self.core.options.lock().unwrap().recv_timeout = timeout;
  }

  /// Resizes the send buffer; when shrinking, the oldest unsent
  /// messages are dropped.
  pub fn set_send_buffer(&self, cap: usize) -> Result<()> {
    self.core.options.lock().unwrap().send_buffer = cap;
    self.core.uwq.resize(cap)
  }

  pub fn set_recv_buffer(&self, cap: usize) -> Result<()> {
    self.core.options.lock().unwrap().recv_buffer = cap;
    self.core.urq.resize(cap)
  }

  /// Sends a message, honouring the configured send timeout.
  pub fn send(&self, msg: Message) -> std::result::Result<(), PutError> {
    let deadline = Deadline::from_timeout(self.core.options.lock().unwrap().send_timeout);
    self.core.uwq.put_until(msg, deadline)
  }

  /// Non-blocking send; fails [`Error::Again`] rather than waiting.
  pub fn try_send(&self, msg: Message) -> std::result::Result<(), PutError> {
    self.core.uwq.try_put(msg)
  }

  pub fn send_until(&self, msg: Message, deadline: Deadline) -> std::result::Result<(), PutError> {
    self.core.uwq.put_until(msg, deadline)
  }

  /// Send aborted when `sig` is raised through the send queue.
  pub fn send_sig(&self, msg: Message, sig: &SignalToken) -> std::result::Result<(), PutError> {
    self.core.uwq.put_sig(msg, sig)
  }

  /// Receives a message, honouring the configured receive timeout.
  pub fn recv(&self) -> Result<Message> {
    let deadline = Deadline::from_timeout(self.core.options.lock().unwrap().recv_timeout);
    self.core.urq.get_until(deadline)
  }

  /// Non-blocking receive; fails [`Error::Again`] rather than waiting.
  pub fn try_recv(&self) -> Result<Message> {
    self.core.urq.try_get()
  }

  pub fn recv_until(&self, deadline: Deadline) -> Result<Message> {
    self.core.urq.get_until(deadline)
  }

  pub fn recv_sig(&self, sig: &SignalToken) -> Result<Message> {
    self.core.urq.get_sig(sig)
  }

  /// Copying convenience over [`send`](Socket::send): wraps `body` in a
  /// fresh message. Not zero-copy; use the message-oriented calls for
  /// that.
  pub fn send_bytes(&self, body: &[u8]) -> Result<()> {
    self.send(Message::from_slice(body)).map_err(|e| e.error)
  }

  /// Copying convenience over [`recv`](Socket::recv): returns the body
  /// of the received message, dropping its header.
  pub fn recv_bytes(&self) -> Result<Bytes> {
    let msg = self.recv()?;
    Ok(Bytes::copy_from_slice(msg.body()))
  }

  /// Registers a listener for every event kind in `mask`. The callback
  /// runs on this socket's delivery worker with no state lock held; it
  /// may re-enter send/recv and submit further events, but it must not
  /// call `add_notify`/`remove_notify` (the listener list is locked
  /// during delivery) and must not block on an event's completion
  /// barrier (delivery is what completes it).
  pub fn add_notify<F>(&self, mask: impl Into<BitFlags<EventKind>>, func: F) -> NotifyHandle
  where
    F: Fn(&EventInfo) + Send + Sync + 'static,
  {
    self.core.add_notify(mask.into(), Box::new(func))
  }

  /// Unregisters a listener. When this returns, the callback is no
  /// longer running and will not run again.
  pub fn remove_notify(&self, handle: NotifyHandle) {
    self.core.remove_notify(handle);
  }

  /// Async stream of events matching `mask`, backed by an internal
  /// listener. See [`EventStream`].
  pub fn event_stream(&self, mask: impl Into<BitFlags<EventKind>>) -> EventStream {
    let shared = Arc::new(StreamShared {
      queue: Mutex::new(VecDeque::new()),
      waker: Mutex::new(None),
    });
    let pusher = Arc::clone(&shared);
    let handle = self
      .core
      .add_notify(mask.into(), Box::new(move |info| pusher.push(info)));
    EventStream {
      shared,
      socket: Arc::downgrade(&self.core),
      handle: Some(handle),
      terminated: AtomicBool::new(false),
    }
  }

  /// Submits `event` for delivery. Returns immediately; pair with
  /// [`wait`](Socket::wait) for a completion barrier. Submitting an
  /// event already in flight is a no-op. The event must have been
  /// created for this socket: its condition variable pairs with this
  /// socket's lock for its whole life.
  pub fn submit(&self, event: &Arc<Event>) {
    self.core.submit(event);
  }

  /// Blocks until the most recent submission of `event` has been
  /// delivered to every matching listener.
  pub fn wait(&self, event: &Arc<Event>) {
    self.core.wait(event);
  }

  fn post_and_wait(&self, event: Event) {
    let event = Arc::new(event);
    self.core.submit(&event);
    self.core.wait(&event);
  }

  /// Announces an attached pipe and waits for listeners to hear of it.
  pub fn pipe_attached(&self, pipe: PipeId) {
    self.post_and_wait(Event::new(EventKind::PipeAdded, self.core.id).with_pipe(pipe));
  }

  pub fn pipe_detached(&self, pipe: PipeId) {
    self.post_and_wait(Event::new(EventKind::PipeRemoved, self.core.id).with_pipe(pipe));
  }

  pub fn endpoint_added(&self, endpoint: EndpointId) {
    self.post_and_wait(Event::new(EventKind::EndpointAdded, self.core.id).with_endpoint(endpoint));
  }

  pub fn endpoint_removed(&self, endpoint: EndpointId) {
    self.post_and_wait(Event::new(EventKind::EndpointRemoved, self.core.id).with_endpoint(endpoint));
  }

  /// Reports an asynchronous socket error to listeners.
  pub fn post_error(&self, error: Error) {
    self.post_and_wait(Event::new(EventKind::SocketError, self.core.id).with_error(error));
  }

  /// Closes the socket: both queues close, queued events complete,
  /// waiters wake with [`Error::Closed`], and the delivery worker is
  /// joined. Idempotent.
  pub fn close(&self) {
    self.core.close();
  }

  pub fn is_closed(&self) -> bool {
    self.core.is_closing()
  }
}

impl Clone for Socket {
  fn clone(&self) -> Socket {
    Socket::from_core(Arc::clone(&self.core))
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    if self.core.user_handles.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.core.close();
    }
  }
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("id", &self.core.id)
      .field("closing", &self.core.is_closing())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::Mutex,
    time::{Duration, Instant},
  };

  use test_case::test_case;

  use super::*;

  fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
      assert!(Instant::now() < deadline, "condition not reached in time");
      thread::sleep(Duration::from_millis(5));
    }
  }

  // Echo glue: pops the send queue and pushes into the receive queue,
  // standing in for a protocol + transport pair.
  fn spawn_loopback(socket: &Socket) -> thread::JoinHandle<()> {
    let uwq = Arc::clone(socket.send_queue());
    let urq = Arc::clone(socket.recv_queue());
    thread::spawn(move || {
      while let Ok(msg) = uwq.get() {
        if urq.put(msg).is_err() {
          break;
        }
      }
    })
  }

  #[test]
  fn send_recv_roundtrip_through_queues() {
    let socket = Socket::open().unwrap();
    let glue = spawn_loopback(&socket);
    socket.send_bytes(b"ping").unwrap();
    assert_eq!(socket.recv_bytes().unwrap(), Bytes::from_static(b"ping"));
    socket.close();
    glue.join().unwrap();
  }

  #[test]
  fn recv_bytes_strips_header() {
    let socket = Socket::open().unwrap();
    let glue = spawn_loopback(&socket);
    let mut msg = Message::from_slice(b"payload");
    msg.header_mut().extend_from_slice(b"route");
    socket.send(msg).unwrap();
    assert_eq!(socket.recv_bytes().unwrap(), Bytes::from_static(b"payload"));
    socket.close();
    glue.join().unwrap();
  }

  #[test]
  fn zero_send_timeout_behaves_like_try_send() {
    let socket = Socket::with_options(SocketOptions {
      send_buffer: 1,
      ..SocketOptions::default()
    })
    .unwrap();
    socket.set_send_timeout(Some(Duration::ZERO));
    socket.send_bytes(b"a").unwrap();
    assert_eq!(socket.send_bytes(b"b").unwrap_err(), Error::Again);
    let err = socket.try_send(Message::from_slice(b"c")).unwrap_err();
    assert_eq!(err.error, Error::Again);
  }

  #[test]
  fn recv_honours_configured_timeout() {
    let socket = Socket::open().unwrap();
    socket.set_recv_timeout(Some(Duration::from_millis(10)));
    let start = Instant::now();
    assert_eq!(socket.recv().unwrap_err(), Error::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(10));
  }

  #[test]
  fn closed_socket_fails_closed() {
    let socket = Socket::open().unwrap();
    socket.close();
    assert_eq!(socket.send_bytes(b"x").unwrap_err(), Error::Closed);
    assert_eq!(socket.recv().unwrap_err(), Error::Closed);
    assert!(socket.is_closed());
    socket.close(); // idempotent
  }

  #[test]
  fn close_unblocks_pending_send() {
    let socket = Socket::with_options(SocketOptions {
      send_buffer: 0,
      ..SocketOptions::default()
    })
    .unwrap();
    let sender = {
      let socket = socket.clone();
      thread::spawn(move || socket.send(Message::from_slice(b"m")))
    };
    thread::sleep(Duration::from_millis(50));
    socket.close();
    assert_eq!(sender.join().unwrap().unwrap_err().error, Error::Closed);
  }

  #[test]
  fn lifecycle_events_reach_matching_listeners() {
    let socket = Socket::open().unwrap();
    let seen: Arc<Mutex<Vec<EventInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = {
      let seen = Arc::clone(&seen);
      socket.add_notify(EventKind::PipeAdded | EventKind::PipeRemoved, move |info| {
        seen.lock().unwrap().push(info.clone());
      })
    };

    let pipe = PipeId::fresh();
    socket.pipe_attached(pipe);
    socket.pipe_detached(pipe);
    // Masked out: must not be delivered to this listener.
    socket.endpoint_added(EndpointId::fresh());

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, BitFlags::from_flag(EventKind::PipeAdded));
    assert_eq!(events[0].pipe, Some(pipe));
    assert_eq!(events[1].kind, BitFlags::from_flag(EventKind::PipeRemoved));
    drop(events);

    socket.remove_notify(handle);
    socket.pipe_attached(pipe);
    assert_eq!(seen.lock().unwrap().len(), 2);
  }

  #[test]
  fn submission_order_is_delivery_order() {
    let socket = Socket::open().unwrap();
    let seen: Arc<Mutex<Vec<BitFlags<EventKind>>>> = Arc::new(Mutex::new(Vec::new()));
    let _handle = {
      let seen = Arc::clone(&seen);
      socket.add_notify(BitFlags::<EventKind>::all(), move |info| {
        seen.lock().unwrap().push(info.kind);
      })
    };
    let ep = EndpointId::fresh();
    let pipe = PipeId::fresh();
    socket.endpoint_added(ep);
    socket.pipe_attached(pipe);
    socket.post_error(Error::TimedOut);
    socket.pipe_detached(pipe);
    let kinds = seen.lock().unwrap().clone();
    assert_eq!(
      kinds,
      vec![
        BitFlags::from_flag(EventKind::EndpointAdded),
        BitFlags::from_flag(EventKind::PipeAdded),
        BitFlags::from_flag(EventKind::SocketError),
        BitFlags::from_flag(EventKind::PipeRemoved),
      ]
    );
  }

  #[test]
  fn wait_returns_only_after_listeners_ran() {
    // Submit, then wait: the barrier must observe the slow listener.
    let socket = Socket::open().unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let _handle = {
      let order = Arc::clone(&order);
      socket.add_notify(EventKind::PipeAdded, move |_| {
        thread::sleep(Duration::from_millis(50));
        order.lock().unwrap().push("delivered");
      })
    };
    socket.pipe_attached(PipeId::fresh());
    order.lock().unwrap().push("returned");
    assert_eq!(*order.lock().unwrap(), vec!["delivered", "returned"]);
  }

  #[test]
  fn post_with_no_listeners_short_circuits() {
    let socket = Socket::open().unwrap();
    let start = Instant::now();
    socket.pipe_attached(PipeId::fresh());
    socket.post_error(Error::InvalidInput);
    assert!(start.elapsed() < Duration::from_secs(1));
  }

  #[test]
  fn readiness_event_fires_once_per_message() {
    let socket = Socket::open().unwrap();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let _handle = {
      let hits = Arc::clone(&hits);
      socket.add_notify(EventKind::CanRecv, move |info| {
        hits.lock().unwrap().push(info.kind);
      })
    };
    // External writer fills the receive queue directly, like a
    // transport would.
    socket
      .recv_queue()
      .put(Message::from_slice(b"m"))
      .unwrap();
    wait_for(|| !hits.lock().unwrap().is_empty());
    assert_eq!(
      hits.lock().unwrap()[0],
      BitFlags::from_flag(EventKind::CanRecv)
    );
    assert_eq!(socket.recv_bytes().unwrap(), Bytes::from_static(b"m"));
    // The get kicks CanPut on the receive queue, which no CanRecv
    // listener should see.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.lock().unwrap().len(), 1);
  }

  #[test]
  fn resize_buffers_through_options() {
    let socket = Socket::with_options(SocketOptions {
      send_buffer: 1,
      ..SocketOptions::default()
    })
    .unwrap();
    socket.send_bytes(b"a").unwrap();
    assert_eq!(socket.try_send(Message::new()).unwrap_err().error, Error::Again);
    socket.set_send_buffer(4).unwrap();
    socket.send_bytes(b"b").unwrap();
    assert_eq!(socket.options().send_buffer, 4);
  }

  #[test]
  fn send_sig_can_be_interrupted() {
    let socket = Socket::with_options(SocketOptions {
      send_buffer: 0,
      ..SocketOptions::default()
    })
    .unwrap();
    let token = SignalToken::new();
    let sender = {
      let socket = socket.clone();
      let token = token.clone();
      thread::spawn(move || socket.send_sig(Message::from_slice(b"m"), &token))
    };
    thread::sleep(Duration::from_millis(50));
    socket.send_queue().signal(&token);
    assert_eq!(sender.join().unwrap().unwrap_err().error, Error::Interrupted);
  }

  #[test]
  fn last_handle_drop_closes_socket() {
    let socket = Socket::open().unwrap();
    let id = socket.id();
    let clone = socket.clone();
    drop(socket);
    assert!(!clone.is_closed());
    drop(clone);
    assert_eq!(global::find_socket(id).unwrap_err(), Error::NotFound);
  }

  #[test_case(EventKind::CanSend)]
  #[test_case(EventKind::CanRecv)]
  fn event_stream_sees_readiness(kind: EventKind) {
    use futures::StreamExt;

    let socket = Socket::open().unwrap();
    let mut stream = socket.event_stream(kind);
    match kind {
      EventKind::CanSend => {
        // A send leaves room in the buffer, which is a CanPut level.
        socket.send_bytes(b"m").unwrap();
      }
      EventKind::CanRecv => {
        socket.recv_queue().put(Message::from_slice(b"m")).unwrap();
      }
      _ => unreachable!(),
    }
    let info = futures::executor::block_on(stream.next()).unwrap();
    assert_eq!(info.kind, BitFlags::from_flag(kind));
    assert_eq!(info.socket, socket.id());
  }

  #[test]
  fn event_stream_terminates_on_close() {
    use futures::StreamExt;
    use futures::stream::FusedStream;

    let socket = Socket::open().unwrap();
    let mut stream = socket.event_stream(EventKind::PipeAdded);
    let pipe = PipeId::fresh();
    socket.pipe_attached(pipe);
    let info = futures::executor::block_on(stream.next()).unwrap();
    assert_eq!(info.pipe, Some(pipe));

    socket.close();
    assert_eq!(futures::executor::block_on(stream.next()), None);
    assert!(stream.is_terminated());
  }
}
