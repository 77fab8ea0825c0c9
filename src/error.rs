use thiserror::Error;

/// Errors surfaced by queue and socket operations.
///
/// These are deliberately coarse: a blocked operation reports *why* it
/// could not complete, and nothing more. Protocol layers map these onto
/// whatever their own callers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The queue or socket has been closed. Terminal.
  #[error("object is closed")]
  Closed,

  /// A non-blocking operation would have had to block.
  #[error("resource temporarily unavailable")]
  Again,

  /// The deadline fired before the operation could complete.
  #[error("operation timed out")]
  TimedOut,

  /// A [`SignalToken`](crate::signal::SignalToken) was raised while the
  /// operation was waiting.
  #[error("operation interrupted")]
  Interrupted,

  /// A caller-supplied argument made no sense.
  #[error("invalid argument")]
  InvalidInput,

  /// A backing buffer could not be allocated.
  #[error("out of memory")]
  OutOfMemory,

  /// An id lookup did not match any live object.
  #[error("no such object")]
  NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_is_stable() {
    // Protocol layers log these verbatim, so the renderings are part of
    // the contract.
    assert_eq!(Error::Closed.to_string(), "object is closed");
    assert_eq!(Error::Again.to_string(), "resource temporarily unavailable");
    assert_eq!(Error::TimedOut.to_string(), "operation timed out");
    assert_eq!(Error::Interrupted.to_string(), "operation interrupted");
  }
}
