//! Future-like handle for an in-flight request. States form a single CAS
//! transition out of `Running`; whichever caller wins the race runs the
//! callback, the loser is a no-op. There is no background timer thread —
//! like `Repeater` in `TcpConnector::poll_with`, timeouts are checked on
//! every `poll` tick of the owning `Context`/`Server`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use inc_timing::Instant;

use crate::error::IncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    Running = 0,
    Done = 1,
    Failed = 2,
    TimedOut = 3,
    Cancelled = 4,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Done,
            2 => Self::Failed,
            3 => Self::TimedOut,
            4 => Self::Cancelled,
            _ => Self::Running,
        }
    }
}

pub type OpResult<T> = Result<T, IncError>;
type Callback<T> = Box<dyn FnOnce(OpResult<T>) + Send>;

struct Inner<T> {
    sequence: u32,
    state: AtomicU8,
    deadline: Option<Instant>,
    result: Mutex<Option<OpResult<T>>>,
    callback: Mutex<Option<Callback<T>>>,
}

/// Refcounted, future-like request handle. Cloning shares the same
/// underlying state — all clones observe the same terminal transition.
pub struct Operation<T> {
    inner: Arc<Inner<T>>,
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("sequence", &self.inner.sequence)
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Operation<T> {
    pub fn new(sequence: u32, timeout: Option<inc_timing::Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sequence,
                state: AtomicU8::new(OpState::Running as u8),
                deadline: timeout.map(|d| Instant::now() + d),
                result: Mutex::new(None),
                callback: Mutex::new(None),
            }),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.inner.sequence
    }

    pub fn state(&self) -> OpState {
        OpState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != OpState::Running
    }

    /// Installs the completion callback. If the operation already reached a
    /// terminal state, the callback runs synchronously right here rather
    /// than being silently dropped.
    pub fn on_complete(&self, cb: impl FnOnce(OpResult<T>) + Send + 'static) {
        let mut slot = self.inner.callback.lock().expect("operation callback mutex poisoned");
        if self.is_terminal() {
            drop(slot);
            if let Some(result) = self.inner.result.lock().expect("operation result mutex poisoned").take() {
                cb(result);
            }
        } else {
            *slot = Some(Box::new(cb));
        }
    }

    fn complete(&self, to: OpState, result: OpResult<T>) -> bool {
        if self
            .inner
            .state
            .compare_exchange(
                OpState::Running as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let cb = self.inner.callback.lock().expect("operation callback mutex poisoned").take();
        match cb {
            Some(cb) => cb(result),
            None => *self.inner.result.lock().expect("operation result mutex poisoned") = Some(result),
        }
        true
    }

    pub fn set_result(&self, value: T) -> bool {
        self.complete(OpState::Done, Ok(value))
    }

    pub fn fail(&self, err: IncError) -> bool {
        self.complete(OpState::Failed, Err(err))
    }

    /// Non-blocking, idempotent: a concurrent `set_result`/`fail` racing with
    /// this call is decided by the CAS in `complete` — whichever lands first
    /// wins and the loser is a no-op. A cancelled operation's callback never
    /// fires.
    pub fn cancel(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                OpState::Running as u8,
                OpState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Called from the owner's poll loop; transitions to `TimedOut` if the
    /// deadline has passed while still `Running`. No-op if there is no
    /// deadline or the operation already completed.
    pub fn poll_timeout(&self, now: Instant) -> bool {
        match self.inner.deadline {
            Some(deadline) if now >= deadline && self.state() == OpState::Running => {
                self.complete(OpState::TimedOut, Err(IncError::TimedOut))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn callback_fires_exactly_once_on_set_result() {
        let op: Operation<u32> = Operation::new(1, None);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        op.on_complete(move |r| {
            assert_eq!(r.unwrap(), 7);
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(op.set_result(7));
        assert!(fired.load(Ordering::SeqCst));
        assert!(!op.set_result(8), "second completion must be a no-op");
    }

    #[test]
    fn cancel_suppresses_callback() {
        let op: Operation<u32> = Operation::new(1, None);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        op.on_complete(move |_| fired2.store(true, Ordering::SeqCst));
        assert!(op.cancel());
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!op.set_result(1), "cancelled op cannot transition again");
    }

    #[test]
    fn late_callback_install_runs_synchronously() {
        let op: Operation<u32> = Operation::new(1, None);
        assert!(op.set_result(5));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        op.on_complete(move |r| {
            assert_eq!(r.unwrap(), 5);
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn poll_timeout_fires_timed_out_after_deadline() {
        let op: Operation<u32> = Operation::new(1, Some(inc_timing::Duration::from_millis(1)));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(op.poll_timeout(Instant::now()));
        assert_eq!(op.state(), OpState::TimedOut);
    }
}
