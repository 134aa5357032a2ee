//! One-shot idle barrier.
//!
//! The orchestrator keeps the [`IdleBarrier`]; the [`BarrierSignal`] travels
//! to the engine inside a barrier job. The signal is consumed by
//! [`BarrierSignal::satisfy`] once every job queued before it has finished.
//! Dropping it unsatisfied (the unit was cancelled and its queue discarded)
//! releases the barrier as abandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

const PENDING: u8 = 0;
const SATISFIED: u8 = 1;
const ABANDONED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    Pending,
    Satisfied,
    Abandoned,
}

impl BarrierOutcome {
    fn decode(raw: u8) -> Self {
        match raw {
            PENDING => BarrierOutcome::Pending,
            SATISFIED => BarrierOutcome::Satisfied,
            ABANDONED => BarrierOutcome::Abandoned,
            other => panic!("corrupted barrier state {other}"),
        }
    }
}

pub fn idle_barrier() -> (IdleBarrier, BarrierSignal) {
    let state = Arc::new(AtomicU8::new(PENDING));
    // Nothing is ever sent; the sender going away is the wake-up.
    let (release_sender, release_receiver) = bounded::<()>(1);
    (
        IdleBarrier {
            state: Arc::clone(&state),
            released: release_receiver,
        },
        BarrierSignal {
            state,
            _release: release_sender,
        },
    )
}

#[derive(Debug)]
pub struct IdleBarrier {
    state: Arc<AtomicU8>,
    released: Receiver<()>,
}

impl IdleBarrier {
    pub fn outcome(&self) -> BarrierOutcome {
        BarrierOutcome::decode(self.state.load(Ordering::Acquire))
    }

    /// `true` once the signal was satisfied or dropped.
    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Blocks until the barrier is released or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> BarrierOutcome {
        match self.released.recv_timeout(timeout) {
            Ok(()) => panic!("idle barrier release channel must never carry messages"),
            Err(RecvTimeoutError::Disconnected) | Err(RecvTimeoutError::Timeout) => {
                self.outcome()
            }
        }
    }
}

#[derive(Debug)]
pub struct BarrierSignal {
    state: Arc<AtomicU8>,
    _release: Sender<()>,
}

impl BarrierSignal {
    pub fn satisfy(self) {
        let previous = self.state.swap(SATISFIED, Ordering::AcqRel);
        if previous != PENDING {
            panic!("idle barrier released twice");
        }
    }
}

impl Drop for BarrierSignal {
    fn drop(&mut self) {
        // Runs before `_release` is dropped, so waiters observe the final state.
        let _ = self.state.compare_exchange(
            PENDING,
            ABANDONED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BarrierOutcome, idle_barrier};

    #[test]
    fn satisfy_releases_barrier() {
        let (barrier, signal) = idle_barrier();
        assert!(!barrier.is_released());
        assert_eq!(barrier.outcome(), BarrierOutcome::Pending);

        signal.satisfy();
        assert!(barrier.is_released());
        assert_eq!(barrier.outcome(), BarrierOutcome::Satisfied);
    }

    #[test]
    fn dropped_signal_abandons_barrier() {
        let (barrier, signal) = idle_barrier();
        drop(signal);
        assert!(barrier.is_released());
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(1)),
            BarrierOutcome::Abandoned
        );
    }

    #[test]
    fn wait_wakes_when_signal_satisfied_on_another_thread() {
        let (barrier, signal) = idle_barrier();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signal.satisfy();
        });

        assert_eq!(
            barrier.wait_timeout(Duration::from_secs(5)),
            BarrierOutcome::Satisfied
        );
        worker.join().expect("join barrier worker");
    }

    #[test]
    fn wait_times_out_while_pending() {
        let (barrier, _signal) = idle_barrier();
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(5)),
            BarrierOutcome::Pending
        );
    }
}
