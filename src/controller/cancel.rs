use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A cancellation flag paired with a condvar-based interruptible sleep,
/// the same intent as the original's `threading.Event.wait(timeout)`.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    signal: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            signal: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.signal;
        let mut woken = lock.lock().unwrap();
        *woken = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`, returning early if cancelled. Returns true if
    /// cancellation interrupted the sleep.
    pub fn wait(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.signal;
        let mut woken = lock.lock().unwrap();
        let deadline = Instant::now() + duration;

        // Loop on the predicate rather than trusting a single wait_timeout:
        // if cancel() locks and sets `woken` between our is_cancelled() check
        // and this lock acquisition, the notify_all would otherwise be missed
        // and we'd sleep out the full duration instead of waking immediately.
        while !*woken {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, result) = cvar.wait_timeout(woken, remaining).unwrap();
            woken = guard;
            if result.timed_out() {
                break;
            }
        }

        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_early_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let interrupted = waiter.wait(Duration::from_secs(30));
            (interrupted, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (interrupted, elapsed) = handle.join().unwrap();
        assert!(interrupted);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn already_cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait(Duration::from_secs(30)));
    }
}
