//! Outbound messages to users and admins.

use tracing::info;

/// Delivers a message to a user; the chat transport sits behind this
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: i64, message: &str);

    /// Send the same message to several users
    fn broadcast(&self, user_ids: &[i64], message: &str) {
        for &user_id in user_ids {
            self.notify(user_id, message);
        }
    }
}

/// Prints messages on the operator console
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, user_id: i64, message: &str) {
        info!(user_id, "notify: {}", message);
        println!("[-> {}] {}", user_id, message);
    }
}

/// Keeps every message for assertions
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    sent: parking_lot::Mutex<Vec<(i64, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_to(&self, user_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, user_id: i64, message: &str) {
        self.sent.lock().push((user_id, message.to_string()));
    }
}
