//! Background sweep that expires overdue access records.

use crate::auth::AuthStore;
use crate::notify::Notifier;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const EXPIRED_MESSAGE: &str = "Your access has expired. Send /auth to request renewal.";

pub struct ExpiryScanner {
    store: Arc<AuthStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

/// Keeps the sweep thread alive; dropping it ends the loop at the next wakeup
pub struct ScannerHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Stop the loop and wait for the thread to finish
    pub fn stop(mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl ExpiryScanner {
    pub fn new(store: Arc<AuthStore>, notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            store,
            notifier,
            interval,
        }
    }

    /// Run one sweep and notify every user whose access lapsed.
    /// Returns how many records were expired.
    pub fn sweep_once(&self) -> usize {
        match self.store.sweep_expired() {
            Ok(expired) => {
                for &user_id in &expired {
                    self.notifier.notify(user_id, EXPIRED_MESSAGE);
                }
                debug!(count = expired.len(), "expiry sweep finished");
                expired.len()
            }
            Err(e) => {
                warn!("expiry sweep failed: {}", e);
                0
            }
        }
    }

    /// Sweep every `interval` on a dedicated thread
    pub fn spawn(self) -> std::io::Result<ScannerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("expiry-scanner".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(self.interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        self.sweep_once();
                    }
                    // stop requested or handle dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(ScannerHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessStatus, ManualClock};
    use crate::notify::RecordingNotifier;
    use chrono::{FixedOffset, TimeDelta, TimeZone, Utc};
    use std::time::Instant;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<ManualClock>, Arc<AuthStore>) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
        ));
        let store = AuthStore::load(
            &dir.path().join("auth.txt"),
            FixedOffset::east_opt(0).unwrap(),
            clock.clone(),
        )
        .unwrap();
        (dir, clock, Arc::new(store))
    }

    #[test]
    fn test_sweep_once_notifies_expired_users() {
        let (_dir, clock, store) = setup();
        store.approve(1, "1h").unwrap();
        store.approve(2, "1d").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let scanner = ExpiryScanner::new(store.clone(), notifier.clone(), Duration::from_secs(60));

        assert_eq!(scanner.sweep_once(), 0);
        clock.advance(TimeDelta::hours(2));
        assert_eq!(scanner.sweep_once(), 1);
        assert_eq!(notifier.sent(), vec![(1, EXPIRED_MESSAGE.to_string())]);
        assert_eq!(store.get(1).unwrap().status, AccessStatus::Expired);

        // already expired records are not announced twice
        assert_eq!(scanner.sweep_once(), 0);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn test_inline_check_first_means_no_sweep_notice() {
        let (_dir, clock, store) = setup();
        store.approve(5, "1h").unwrap();
        clock.advance(TimeDelta::hours(2));
        assert!(!store.is_authorized(5).unwrap());

        let notifier = Arc::new(RecordingNotifier::default());
        let scanner = ExpiryScanner::new(store.clone(), notifier.clone(), Duration::from_secs(60));
        assert_eq!(scanner.sweep_once(), 0);
        assert_eq!(store.get(5).unwrap().status, AccessStatus::Expired);
    }

    #[test]
    fn test_spawned_loop_sweeps_and_stops() {
        let (_dir, clock, store) = setup();
        store.approve(8, "1h").unwrap();
        clock.advance(TimeDelta::hours(1));

        let notifier = Arc::new(RecordingNotifier::default());
        let handle = ExpiryScanner::new(store.clone(), notifier.clone(), Duration::from_millis(10))
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while notifier.sent().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        assert_eq!(notifier.sent_to(8), vec![EXPIRED_MESSAGE.to_string()]);
    }
}
