//! In-process messaging core for scalability protocols.
//!
//! This crate is the substrate that request/reply, publish/subscribe,
//! pipeline, pair, and survey protocols are built on. It deliberately
//! stops below transports and protocol state machines; what it
//! provides is the concurrency contract those layers share:
//!
//! * [`MsgQueue`] — a bounded, closable, resizable FIFO of
//!   [`Message`]s with blocking, timed, and non-blocking put/get,
//!   signal-interruptible waits, and head-of-queue putback. Protocol
//!   glue moves messages between per-socket and per-pipe queues.
//! * A per-queue *readiness notifier*: level-triggered
//!   [`Ready::CanPut`]/[`Ready::CanGet`] kicks fanned out to a
//!   registered callback outside the queue lock.
//! * A per-[`Socket`] *event bus* that serialises delivery of typed
//!   [`EventKind`] events (readiness, pipe and endpoint lifecycle,
//!   errors) to masked listeners on a dedicated worker, with a
//!   completion barrier for submitters.
//!
//! Scheduling is plain OS threads: each queue with a notifier owns one
//! worker, each socket owns one delivery worker, and application
//! threads call put/get/send/recv directly. Blocking happens only
//! inside queue put/get/drain, the two workers, and event waits.
//!
//! # Example
//!
//! ```
//! use scamp::Socket;
//!
//! # fn main() -> Result<(), scamp::Error> {
//! let socket = Socket::open()?;
//!
//! // Protocol/transport glue: echo everything the application sends
//! // back to its receive side.
//! let uwq = std::sync::Arc::clone(socket.send_queue());
//! let urq = std::sync::Arc::clone(socket.recv_queue());
//! std::thread::spawn(move || {
//!   while let Ok(msg) = uwq.get() {
//!     if urq.put(msg).is_err() {
//!       break;
//!     }
//!   }
//! });
//!
//! socket.send_bytes(b"hello")?;
//! let reply = socket.recv()?;
//! assert_eq!(reply.body(), &b"hello"[..]);
//! socket.close();
//! # Ok(())
//! # }
//! ```
//!
//! Sockets are looked up by id through [`find_socket`], and [`fini`]
//! tears the whole library down (closing every socket and joining all
//! worker threads); it re-initialises lazily on next use.

pub mod error;
pub mod event;
pub mod global;
pub mod message;
pub mod msgqueue;
pub mod signal;
pub mod socket;
pub mod timing;

pub use error::{Error, Result};
pub use event::{Event, EventInfo, EventKind, EventStream, NotifyHandle};
pub use global::{find_socket, fini, EndpointId, PipeId, SocketId};
pub use message::Message;
pub use msgqueue::{MsgQueue, PutError, Ready};
pub use signal::SignalToken;
pub use socket::{Socket, SocketOptions};
pub use timing::Deadline;
