//! Per-connection parallelism limiter
//!
//! Bounds how many hub method bodies of one connection run at once. Acquiring
//! never blocks the caller: when no slot is free the request is queued (FIFO)
//! and the returned receiver resolves once an earlier permit is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

struct LimiterState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<SlotPermit>>,
}

/// Slot counter shared by one connection's invocations.
#[derive(Clone)]
pub struct ParallelismLimiter {
    state: Arc<Mutex<LimiterState>>,
}

/// Outcome of [`ParallelismLimiter::acquire`]
pub enum Acquire {
    Ready(SlotPermit),
    Queued(oneshot::Receiver<SlotPermit>),
}

impl Acquire {
    /// Wait for the slot. `None` if the limiter went away while queued.
    pub async fn wait(self) -> Option<SlotPermit> {
        match self {
            Acquire::Ready(permit) => Some(permit),
            Acquire::Queued(rx) => rx.await.ok(),
        }
    }
}

/// One occupied slot. Dropping it hands the slot to the next waiter.
pub struct SlotPermit {
    state: Option<Arc<Mutex<LimiterState>>>,
}

fn lock(state: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ParallelismLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                available: max.max(1),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Take a slot now, or join the queue.
    pub fn acquire(&self) -> Acquire {
        let mut state = lock(&self.state);
        if state.available > 0 {
            state.available -= 1;
            return Acquire::Ready(SlotPermit {
                state: Some(self.state.clone()),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Acquire::Queued(rx)
    }

    pub fn available(&self) -> usize {
        lock(&self.state).available
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).waiters.len()
    }
}

fn release(state: &Arc<Mutex<LimiterState>>) {
    let mut permit = SlotPermit {
        state: Some(state.clone()),
    };
    loop {
        let next = {
            let mut guard = lock(state);
            match guard.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    guard.available += 1;
                    permit.state = None;
                    return;
                }
            }
        };
        // A waiter whose receiver is gone returns the permit; try the next one.
        match next.send(permit) {
            Ok(()) => return,
            Err(returned) => permit = returned,
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

// =============================================================================
// Invocation lease
// =============================================================================

enum LeaseState {
    Held(SlotPermit),
    Parked,
    Finished,
}

/// The slot held by one running invocation.
///
/// An invocation waiting on a client result parks its lease so queued
/// invocations can run, then resumes it (waiting for a slot again) before
/// continuing.
pub struct InvocationLease {
    limiter: ParallelismLimiter,
    state: Mutex<LeaseState>,
}

impl InvocationLease {
    pub fn new(limiter: ParallelismLimiter, permit: SlotPermit) -> Self {
        Self {
            limiter,
            state: Mutex::new(LeaseState::Held(permit)),
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give the slot back while waiting on the network.
    pub fn park(&self) {
        let previous = {
            let mut state = self.state();
            match &*state {
                LeaseState::Held(_) => std::mem::replace(&mut *state, LeaseState::Parked),
                _ => return,
            }
        };
        drop(previous);
    }

    /// Take a slot again after [`park`](Self::park).
    pub async fn resume(&self) {
        if !matches!(*self.state(), LeaseState::Parked) {
            return;
        }
        let permit = self.limiter.acquire().wait().await;
        let mut state = self.state();
        if let (Some(permit), LeaseState::Parked) = (permit, &*state) {
            *state = LeaseState::Held(permit);
        }
    }

    /// Release the slot for good.
    pub fn finish(&self) {
        let previous = std::mem::replace(&mut *self.state(), LeaseState::Finished);
        drop(previous);
    }

    pub fn is_held(&self) -> bool {
        matches!(*self.state(), LeaseState::Held(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let limiter = ParallelismLimiter::new(1);
        let first = limiter.acquire().wait().await.unwrap();

        let second = limiter.acquire();
        let third = limiter.acquire();
        assert_eq!(limiter.queued(), 2);

        let (Acquire::Queued(mut second), Acquire::Queued(mut third)) = (second, third) else {
            panic!("expected queued acquires");
        };

        drop(first);
        let second_permit = second.try_recv().unwrap();
        assert!(third.try_recv().is_err());

        drop(second_permit);
        assert!(third.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slots_return_when_queue_empty() {
        let limiter = ParallelismLimiter::new(2);
        let a = limiter.acquire().wait().await.unwrap();
        let b = limiter.acquire().wait().await.unwrap();
        assert_eq!(limiter.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let limiter = ParallelismLimiter::new(1);
        let held = limiter.acquire().wait().await.unwrap();

        let abandoned = limiter.acquire();
        let Acquire::Queued(mut next) = limiter.acquire() else {
            panic!("expected queued acquire");
        };
        drop(abandoned);

        drop(held);
        assert!(next.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_parked_lease_lets_others_run() {
        let limiter = ParallelismLimiter::new(1);
        let permit = limiter.acquire().wait().await.unwrap();
        let lease = InvocationLease::new(limiter.clone(), permit);

        lease.park();
        assert!(!lease.is_held());
        let other = limiter.acquire().wait().await.unwrap();

        let resumed = tokio::spawn(async move {
            lease.resume().await;
            lease.is_held()
        });
        tokio::task::yield_now().await;
        drop(other);
        assert!(resumed.await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_releases_once() {
        let limiter = ParallelismLimiter::new(1);
        let permit = limiter.acquire().wait().await.unwrap();
        let lease = InvocationLease::new(limiter.clone(), permit);

        lease.finish();
        lease.finish();
        lease.park();
        assert_eq!(limiter.available(), 1);
    }
}
