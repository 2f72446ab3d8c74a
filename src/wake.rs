#![allow(dead_code)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;

/// A process-wide, level-triggered wake event. `set()` before anyone is
/// waiting still causes the next `wait` to return immediately — plain
/// `Notify::notified()` alone is edge-triggered and would miss that.
#[derive(Clone)]
pub struct WakeSignal {
    notify: Arc<Notify>,
    flag: Arc<AtomicBool>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Waits until woken or `timeout` elapses, then clears the flag.
    /// Returns `true` if woken, `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.flag.swap(false, Ordering::SeqCst) {
            return true;
        }

        let woken = tokio::time::timeout(timeout, self.notify.notified()).await.is_ok();
        self.flag.store(false, Ordering::SeqCst);
        woken
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_before_wait_still_wakes_immediately() {
        let signal = WakeSignal::new();
        signal.set();
        let woken = signal.wait(Duration::from_millis(50)).await;
        assert!(woken);
    }

    #[tokio::test]
    async fn wait_without_set_times_out() {
        let signal = WakeSignal::new();
        let woken = signal.wait(Duration::from_millis(20)).await;
        assert!(!woken);
    }

    #[tokio::test]
    async fn concurrent_set_wakes_waiter() {
        let signal = WakeSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();

        assert!(handle.await.unwrap());
    }
}
