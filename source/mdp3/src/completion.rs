//! Single-slot completions, used to hand an interrupt off to a waiting task.
//!
//! A [`Completion`] is a one-bit "it happened" signal. The interrupt handler
//! calls [`Completion::complete`]; the waiting task awaits
//! [`Completion::wait`]. Signalling is sticky: a completion signalled before
//! anyone waits is observed by the next wait. That's the reason every waiter
//! must [`reinit`](Completion::reinit) the completion *before* it starts the
//! hardware operation it is going to wait for. Otherwise the wait returns
//! immediately on the previous operation's signal.
//!
//! A pending completion may also be *interrupted*, which makes the current
//! (or next) wait give up with [`Interrupted`]. This is how a waiting caller
//! is cancelled without touching the hardware.
use core::fmt;

use maitake_sync::WaitCell;
use portable_atomic::{AtomicU8, Ordering};

/// Armed; the event has not happened yet.
const PENDING: u8 = 0;
/// The event happened.
const COMPLETE: u8 = 1;
/// The waiter was asked to give up before the event happened.
const INTERRUPTED: u8 = 2;

pub struct Completion {
    state: AtomicU8,
    wait: WaitCell,
}

/// Returned by [`Completion::wait`] when the wait was interrupted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Interrupted(());

// === impl Completion ===

impl Completion {
    /// Returns a new, pending completion.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            wait: WaitCell::new(),
        }
    }

    /// Re-arms the completion, discarding any previous signal or
    /// interruption.
    #[inline]
    pub fn reinit(&self) {
        self.state.store(PENDING, Ordering::Release);
    }

    /// Signals the completion, waking the waiter if there is one.
    ///
    /// This may be called from interrupt context.
    #[inline]
    pub fn complete(&self) {
        self.state.store(COMPLETE, Ordering::Release);
        self.wait.wake();
    }

    /// Interrupts a pending completion, so that the current wait (or, if no
    /// one is waiting, the next one) returns [`Interrupted`].
    ///
    /// Returns `false` if the completion was already signalled or
    /// interrupted, in which case nothing changes.
    pub fn interrupt(&self) -> bool {
        let interrupted = self
            .state
            .compare_exchange(PENDING, INTERRUPTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if interrupted {
            self.wait.wake();
        }
        interrupted
    }

    /// Withdraws an interruption nobody consumed, returning the completion to
    /// pending. A signal is left alone.
    #[inline]
    pub fn withdraw_interrupt(&self) -> bool {
        self.state
            .compare_exchange(INTERRUPTED, PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if the completion has been signalled since it was last
    /// re-armed.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Waits until the completion is signalled.
    ///
    /// Returns immediately if it already was. A completion has one waiter at
    /// a time.
    ///
    /// # Cancel Safety
    ///
    /// Dropping this future leaves the completion as it was: a later signal
    /// is still observed by the next wait.
    pub async fn wait(&self) -> Result<(), Interrupted> {
        loop {
            // register our waker before checking the state, so that a signal
            // landing between the check and the await still wakes us.
            let wait = self.wait.subscribe().await;

            match self.state.load(Ordering::Acquire) {
                COMPLETE => return Ok(()),
                INTERRUPTED => {
                    // consume the interruption; a `complete` racing with us
                    // wins, and is left for the next wait.
                    let _ = self.state.compare_exchange(
                        INTERRUPTED,
                        PENDING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Err(Interrupted(()));
                }
                _ => {}
            }

            let _wait = wait.await;
            debug_assert!(_wait.is_ok(), "completion WaitCells are never closed");
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            COMPLETE => "complete",
            INTERRUPTED => "interrupted",
            _ => "unknown",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

// === impl Interrupted ===

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("wait interrupted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn signal_before_wait_is_sticky() {
        let c = Completion::new();
        c.complete();
        assert!(c.is_complete());
        assert_eq!(block_on(c.wait()), Ok(()));
        // waiting doesn't consume the signal; only `reinit` does.
        assert_eq!(block_on(c.wait()), Ok(()));
    }

    #[test]
    fn reinit_discards_stale_signal() {
        let c = Arc::new(Completion::new());
        c.complete();
        c.reinit();
        assert!(!c.is_complete());

        let signaller = {
            let c = c.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                c.complete();
            })
        };
        assert_eq!(block_on(c.wait()), Ok(()));
        signaller.join().unwrap();
    }

    #[test]
    fn withdrawn_interrupt_is_not_seen_by_next_wait() {
        let c = Arc::new(Completion::new());
        assert!(c.interrupt());
        assert!(c.withdraw_interrupt());
        // nothing to withdraw once pending again.
        assert!(!c.withdraw_interrupt());

        let signaller = {
            let c = c.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                c.complete();
            })
        };
        assert_eq!(block_on(c.wait()), Ok(()));
        signaller.join().unwrap();
        assert!(!c.withdraw_interrupt());
        assert!(c.is_complete());
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let c = Arc::new(Completion::new());
        let interrupter = {
            let c = c.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                assert!(c.interrupt());
            })
        };
        assert_eq!(block_on(c.wait()), Err(Interrupted(())));
        interrupter.join().unwrap();

        // the interruption was consumed by the wait.
        c.complete();
        assert_eq!(block_on(c.wait()), Ok(()));
    }

    #[test]
    fn interrupt_after_complete_is_ignored() {
        let c = Completion::new();
        c.complete();
        assert!(!c.interrupt());
        assert_eq!(block_on(c.wait()), Ok(()));
    }
}
