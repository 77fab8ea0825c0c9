// Process-wide library state: id allocation and the socket registry.
//
// State is created lazily on first use and torn down by `fini`, after
// which the library can be initialised again. Id counters start at a
// random point so ids are not predictable across runs.

use std::{
  collections::HashMap,
  fmt,
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, Weak,
  },
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{Error, Result},
  socket::{Socket, SocketCore},
};

/// Identity of a socket, usable to look the socket up again through
/// [`find_socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u32);

/// Identity of a pipe (one established connection under an endpoint).
/// Pipes themselves are owned by the transport layer; the core only
/// carries their identity in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(pub(crate) u32);

/// Identity of an endpoint (dialer or listener). As with pipes, only
/// the identity crosses into the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) u32);

impl fmt::Display for SocketId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for PipeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for EndpointId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl PipeId {
  /// Allocates a fresh pipe id. Called by transport glue when a
  /// connection is established.
  pub fn fresh() -> PipeId {
    PipeId(instance().next_pipe.fetch_add(1, Ordering::Relaxed))
  }
}

impl EndpointId {
  /// Allocates a fresh endpoint id.
  pub fn fresh() -> EndpointId {
    EndpointId(instance().next_endpoint.fetch_add(1, Ordering::Relaxed))
  }
}

struct Global {
  next_socket: AtomicU32,
  next_pipe: AtomicU32,
  next_endpoint: AtomicU32,
  sockets: Mutex<HashMap<SocketId, Weak<SocketCore>>>,
}

static GLOBAL: Mutex<Option<Arc<Global>>> = Mutex::new(None);

fn instance() -> Arc<Global> {
  let mut slot = GLOBAL.lock().unwrap();
  match &*slot {
    Some(global) => Arc::clone(global),
    None => {
      debug!("initialising library state");
      // Nonzero random starting points, as ids of 0 read like
      // uninitialised memory in logs.
      let global = Arc::new(Global {
        next_socket: AtomicU32::new((rand::random::<u32>() & 0x00FF_FFFF) | 1),
        next_pipe: AtomicU32::new((rand::random::<u32>() & 0x00FF_FFFF) | 1),
        next_endpoint: AtomicU32::new((rand::random::<u32>() & 0x00FF_FFFF) | 1),
        sockets: Mutex::new(HashMap::new()),
      });
      *slot = Some(Arc::clone(&global));
      global
    }
  }
}

pub(crate) fn next_socket_id() -> SocketId {
  SocketId(instance().next_socket.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn register_socket(core: &Arc<SocketCore>) {
  instance()
    .sockets
    .lock()
    .unwrap()
    .insert(core.id(), Arc::downgrade(core));
}

pub(crate) fn unregister_socket(id: SocketId) {
  let slot = GLOBAL.lock().unwrap();
  if let Some(global) = &*slot {
    global.sockets.lock().unwrap().remove(&id);
  }
}

/// Looks up a live socket by id. Fails [`Error::NotFound`] once the
/// socket has been closed.
pub fn find_socket(id: SocketId) -> Result<Socket> {
  let global = instance();
  let sockets = global.sockets.lock().unwrap();
  sockets
    .get(&id)
    .and_then(Weak::upgrade)
    .map(Socket::from_core)
    .ok_or(Error::NotFound)
}

/// Tears the library down: closes every registered socket (joining
/// their worker threads) and resets the global state. The library
/// re-initialises lazily on next use.
pub fn fini() {
  let taken = GLOBAL.lock().unwrap().take();
  let Some(global) = taken else {
    return;
  };
  let sockets: Vec<Weak<SocketCore>> = global.sockets.lock().unwrap().drain().map(|(_, w)| w).collect();
  let mut closed = 0;
  for weak in sockets {
    if let Some(core) = weak.upgrade() {
      core.close();
      closed += 1;
    }
  }
  debug!("library state torn down, {closed} socket(s) closed");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn socket_ids_are_unique() {
    let a = next_socket_id();
    let b = next_socket_id();
    assert_ne!(a, b);
  }

  #[test]
  fn pipe_and_endpoint_ids_allocate() {
    assert_ne!(PipeId::fresh(), PipeId::fresh());
    assert_ne!(EndpointId::fresh(), EndpointId::fresh());
  }

  #[test]
  fn find_socket_roundtrip() {
    let socket = Socket::open().unwrap();
    let id = socket.id();
    let found = find_socket(id).unwrap();
    assert_eq!(found.id(), id);
    drop(found);
    socket.close();
    assert_eq!(find_socket(id).unwrap_err(), Error::NotFound);
  }

  #[test]
  fn find_socket_unknown_id() {
    assert_eq!(find_socket(SocketId(0)).unwrap_err(), Error::NotFound);
  }
}
