use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crate::error::{Error, Result};

const PENDING: u32 = 0;
const COMPLETE: u32 = 1;
const TRANSPORT_FAILED: u32 = 2;
const CANCELLED: u32 = 3;
const INVALID: u32 = 4;

/// Spin this many rounds before starting to yield in [`Handle::wait`].
const SPIN_ROUNDS: u32 = 64;

struct HandleInner {
    /// One-shot completion flag. Stores are release, loads acquire, so
    /// observing a resolved state establishes happens-before with the
    /// NIC-acknowledged transfer.
    state: AtomicU32,

    /// Human-readable failure detail, set before the state store.
    detail: OnceLock<String>,
}

/// Completion handle of one `send` or `recv` submission.
///
/// Cheaply cloneable; every clone observes the same one-shot outcome.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    fn with_state(state: u32, detail: Option<String>) -> Self {
        let inner = HandleInner {
            state: AtomicU32::new(state),
            detail: OnceLock::new(),
        };
        if let Some(detail) = detail {
            let _ = inner.detail.set(detail);
        }
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A handle awaiting resolution by an I/O engine.
    pub(crate) fn pending() -> Self {
        Self::with_state(PENDING, None)
    }

    /// A handle rejected at submission time.
    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Self::with_state(INVALID, Some(detail.into()))
    }

    /// A handle submitted to an already-failed context.
    pub(crate) fn transport_failed(detail: impl Into<String>) -> Self {
        Self::with_state(TRANSPORT_FAILED, Some(detail.into()))
    }

    /// A handle submitted to a finalized context.
    pub(crate) fn cancelled() -> Self {
        Self::with_state(CANCELLED, None)
    }

    fn resolve(&self, state: u32, detail: Option<&str>) {
        if let Some(detail) = detail {
            let _ = self.inner.detail.set(detail.to_owned());
        }
        // First resolution wins.
        let _ = self.inner.state.compare_exchange(
            PENDING,
            state,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Mark the operation as successfully completed.
    pub(crate) fn complete(&self) {
        self.resolve(COMPLETE, None);
    }

    /// Resolve the handle to `TransportFailed`.
    pub(crate) fn fail_transport(&self, detail: &str) {
        self.resolve(TRANSPORT_FAILED, Some(detail));
    }

    /// Resolve the handle to `Cancelled`.
    pub(crate) fn fail_cancelled(&self) {
        self.resolve(CANCELLED, None);
    }

    /// Resolve the handle to `InvalidArgument`.
    pub(crate) fn fail_invalid(&self, detail: &str) {
        self.resolve(INVALID, Some(detail));
    }

    fn decode(&self, state: u32) -> Result<()> {
        let detail = || {
            self.inner
                .detail
                .get()
                .cloned()
                .unwrap_or_else(|| "transport failure".to_owned())
        };
        match state {
            COMPLETE => Ok(()),
            TRANSPORT_FAILED => Err(Error::TransportFailed(detail())),
            CANCELLED => Err(Error::Cancelled),
            INVALID => Err(Error::InvalidArgument(detail())),
            _ => unreachable!("observed unresolved handle state {}", state),
        }
    }

    /// Non-blocking probe. `None` while the operation is still pending.
    pub fn try_wait(&self) -> Option<Result<()>> {
        match self.inner.state.load(Ordering::Acquire) {
            PENDING => None,
            state => Some(self.decode(state)),
        }
    }

    /// Block until the operation resolves.
    ///
    /// Spins briefly and then yields; there is no per-operation timeout.
    pub fn wait(&self) -> Result<()> {
        let mut rounds = 0u32;
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                PENDING => {
                    if rounds < SPIN_ROUNDS {
                        rounds += 1;
                        hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
                state => return self.decode(state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_from_other_thread() {
        let handle = Handle::pending();
        assert!(handle.try_wait().is_none());

        let signaller = handle.clone();
        let t = thread::spawn(move || signaller.complete());
        assert!(handle.wait().is_ok());
        t.join().unwrap();
        assert!(matches!(handle.try_wait(), Some(Ok(()))));
    }

    #[test]
    fn test_prefailed_states() {
        assert!(matches!(
            Handle::invalid("zero-length submission").wait(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Handle::transport_failed("boom").wait(),
            Err(Error::TransportFailed(_))
        ));
        assert!(matches!(Handle::cancelled().wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_first_resolution_wins() {
        let handle = Handle::pending();
        handle.complete();
        handle.fail_transport("late failure");
        assert!(handle.wait().is_ok());
    }
}
