use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use static_assertions::assert_impl_all;

/// Shared interrupt flag polled at wait boundaries.
///
/// A `SignalToken` aborts a *specific call site*: hand a clone to
/// [`MsgQueue::put_sig`](crate::msgqueue::MsgQueue::put_sig) or
/// [`get_sig`](crate::msgqueue::MsgQueue::get_sig), and raise it from
/// whichever path orchestrates cancellation (typically a pipe-close
/// path). A raised token observed under the queue lock makes the call
/// fail [`Interrupted`](crate::error::Error::Interrupted) before the
/// next condition-variable sleep.
///
/// Raising the token does not by itself wake a sleeping waiter; use
/// [`MsgQueue::signal`](crate::msgqueue::MsgQueue::signal), which raises
/// the token *and* wakes every waiter on that queue. The token must be
/// clear whenever no interrupt is outstanding.
#[derive(Debug, Clone, Default)]
pub struct SignalToken {
  raised: Arc<AtomicBool>,
}

assert_impl_all!(SignalToken: Send, Sync);

impl SignalToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn raise(&self) {
    self.raised.store(true, Ordering::SeqCst);
  }

  pub fn clear(&self) {
    self.raised.store(false, Ordering::SeqCst);
  }

  pub fn is_raised(&self) -> bool {
    self.raised.load(Ordering::SeqCst)
  }
}
