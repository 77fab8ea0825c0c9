use std::{
  sync::{Condvar, MutexGuard},
  time::{Duration, Instant},
};

/// Absolute deadline for a blocking operation.
///
/// Every blocking entry point in this crate takes a `Deadline` rather
/// than a relative timeout, so that a retry loop does not silently
/// extend the caller's overall budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
  /// Block for as long as it takes.
  Never,
  /// Do not block at all. A wait against this deadline has already
  /// expired.
  Now,
  /// Block until the given instant.
  At(Instant),
}

impl Deadline {
  /// Deadline `timeout` from now.
  pub fn after(timeout: Duration) -> Self {
    Deadline::At(Instant::now() + timeout)
  }

  /// Maps a socket-style timeout option: `None` means block forever,
  /// a zero duration means poll.
  pub fn from_timeout(timeout: Option<Duration>) -> Self {
    match timeout {
      None => Deadline::Never,
      Some(d) if d.is_zero() => Deadline::Now,
      Some(d) => Deadline::after(d),
    }
  }

  pub fn is_now(&self) -> bool {
    matches!(self, Deadline::Now)
  }

  /// One deadline-aware wait on `cv`. Returns the reacquired guard and
  /// whether the deadline has fired.
  ///
  /// Spurious wake-ups are reported as `false`; callers are expected to
  /// loop re-checking their predicate, as with any condition variable.
  pub(crate) fn wait_on<'a, T>(
    self,
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
  ) -> (MutexGuard<'a, T>, bool) {
    match self {
      Deadline::Never => (cv.wait(guard).unwrap(), false),
      Deadline::Now => (guard, true),
      Deadline::At(when) => {
        let now = Instant::now();
        if when <= now {
          return (guard, true);
        }
        let (guard, result) = cv.wait_timeout(guard, when - now).unwrap();
        (guard, result.timed_out())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  #[test]
  fn now_never_sleeps() {
    let m = Mutex::new(());
    let cv = Condvar::new();
    let start = Instant::now();
    let (_g, timed_out) = Deadline::Now.wait_on(&cv, m.lock().unwrap());
    assert!(timed_out);
    assert!(start.elapsed() < Duration::from_millis(50));
  }

  #[test]
  fn expired_deadline_fires_immediately() {
    let m = Mutex::new(());
    let cv = Condvar::new();
    let past = Deadline::At(Instant::now() - Duration::from_millis(1));
    let (_g, timed_out) = past.wait_on(&cv, m.lock().unwrap());
    assert!(timed_out);
  }

  #[test]
  fn wait_times_out_after_deadline() {
    let m = Mutex::new(());
    let cv = Condvar::new();
    let start = Instant::now();
    let (_g, timed_out) =
      Deadline::after(Duration::from_millis(20)).wait_on(&cv, m.lock().unwrap());
    assert!(timed_out);
    assert!(start.elapsed() >= Duration::from_millis(20));
  }

  #[test]
  fn from_timeout_mapping() {
    assert_eq!(Deadline::from_timeout(None), Deadline::Never);
    assert_eq!(Deadline::from_timeout(Some(Duration::ZERO)), Deadline::Now);
    assert!(matches!(
      Deadline::from_timeout(Some(Duration::from_secs(1))),
      Deadline::At(_)
    ));
  }
}
