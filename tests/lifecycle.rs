// Global init / fini lifecycle. Kept in its own integration binary on
// purpose: fini closes every registered socket, so these steps cannot
// share a process with the rest of the test suite.

use std::time::Duration;

use anyhow::Result;
use scamp::{find_socket, fini, Error, Socket};

#[test]
fn fini_closes_sockets_and_reinitialises() -> Result<()> {
  let _ = env_logger::builder().is_test(true).try_init();

  let socket = Socket::open()?;
  let id = socket.id();
  assert_eq!(find_socket(id)?.id(), id);

  fini();

  // Existing handles survive, but observe the closed state.
  assert!(socket.is_closed());
  assert_eq!(socket.send_bytes(b"x").unwrap_err(), Error::Closed);
  assert_eq!(find_socket(id).unwrap_err(), Error::NotFound);

  // The library restarts lazily on next use.
  let reborn = Socket::open()?;
  reborn.set_recv_timeout(Some(Duration::from_millis(5)));
  assert_eq!(reborn.recv().unwrap_err(), Error::TimedOut);
  reborn.close();
  fini();
  Ok(())
}
