//! Proactive access token renewal.
//!
//! A single one-shot timer is kept per session. Arming a new timer aborts the
//! previous one, so a session never has two renewals pending.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Tokens living longer than this renew a fixed margin before expiry
const LONG_LIVED_THRESHOLD_SECS: f64 = 600.0;

/// Margin before expiry for long-lived tokens
const RENEWAL_MARGIN_SECS: f64 = 300.0;

/// Upper bound on a renewal delay; tokens claiming a longer life renew daily
pub const MAX_RENEWAL_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before renewing a token that expires in `expires_in` seconds.
///
/// Zero means renew now. Short-lived tokens renew at half their remaining
/// lifetime. Never exceeds [`MAX_RENEWAL_DELAY`].
pub fn renewal_delay(expires_in: f64) -> Duration {
    let secs = if expires_in <= 0.0 {
        return Duration::ZERO;
    } else if expires_in > LONG_LIVED_THRESHOLD_SECS {
        expires_in - RENEWAL_MARGIN_SECS
    } else {
        expires_in / 2.0
    };
    Duration::try_from_secs_f64(secs)
        .map(|delay| delay.min(MAX_RENEWAL_DELAY))
        .unwrap_or(MAX_RENEWAL_DELAY)
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<PendingTimer>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<PendingTimer>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrements the pending counter when a timer fires or is aborted
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct SessionScheduler {
    slot: Slot,
    generation: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl SessionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any timer that is still pending.
    pub fn arm<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = PendingGuard::new(Arc::clone(&self.pending));
        let slot = Arc::clone(&self.slot);

        // Held across the spawn so an immediately firing timer cannot release
        // the slot before it is filled.
        let mut current = lock(&self.slot);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut current = lock(&slot);
                if current.as_ref().map(|t| t.generation) == Some(generation) {
                    current.take();
                }
            }
            drop(guard);
            task.await;
        });

        if let Some(previous) = current.replace(PendingTimer { generation, handle }) {
            debug!(generation = previous.generation, "Superseding pending renewal timer");
            previous.handle.abort();
        }
        debug!(generation, delay_secs = delay.as_secs_f64(), "Renewal timer armed");
    }

    /// Abort the pending timer, if any
    pub fn cancel(&self) {
        if let Some(previous) = lock(&self.slot).take() {
            debug!(generation = previous.generation, "Renewal timer cancelled");
            previous.handle.abort();
        }
    }

    /// Timers armed but not yet fired or cancelled
    pub fn pending_timers(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
