//! Graceful shutdown: server phase, shutdown signal, and in-flight tracking.
//!
//! POST dispatches and open socket connections each hold an
//! [`InFlightGuard`]; shutdown waits for the count to reach zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Server lifecycle phase.
///
/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Starting,
    /// Accepting requests and upgrades.
    Ready,
    /// Refusing new work while in-flight work finishes.
    Draining,
    Stopped,
}

/// Coordinates shutdown between the front end and connection tasks.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    phase: ArcSwap<ServerPhase>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` phase.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            phase: ArcSwap::from_pointee(ServerPhase::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.phase.store(Arc::new(ServerPhase::Ready));
    }

    #[must_use]
    pub fn phase(&self) -> ServerPhase {
        **self.phase.load()
    }

    /// Whether new requests and upgrades should be refused.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.phase(), ServerPhase::Draining | ServerPhase::Stopped)
    }

    /// Receiver flipped to `true` when shutdown starts.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and wakes every shutdown receiver.
    pub fn trigger_shutdown(&self) {
        self.phase.store(Arc::new(ServerPhase::Draining));
        // Receivers may already be gone.
        let _ = self.shutdown_signal.send(true);
    }

    /// Counts one unit of in-flight work until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for in-flight work to finish.
    ///
    /// Returns `true` and moves to `Stopped` once the count reaches zero;
    /// returns `false` (still `Draining`) on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.phase.store(Arc::new(ServerPhase::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), ServerPhase::Starting);
        assert!(!controller.is_shutting_down());

        controller.set_ready();
        assert_eq!(controller.phase(), ServerPhase::Ready);

        controller.trigger_shutdown();
        assert_eq!(controller.phase(), ServerPhase::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn guards_track_in_flight_work() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn receivers_see_the_signal() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.phase(), ServerPhase::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_while_work_remains() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.phase(), ServerPhase::Draining);
    }
}
