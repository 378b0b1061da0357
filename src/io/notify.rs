//! Notification sinks - where the listener reports what happened
//!
//! The core never blocks on the host: sinks must return immediately.

use crate::domain::types::Notification;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Bounded channel to the host; notifications are dropped when it is full
impl NotificationSink for mpsc::Sender<Notification> {
    fn notify(&self, notification: Notification) {
        match self.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(event = %n.name(), "notification_dropped_channel_full");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("notification_channel_closed");
            }
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}

/// Create a notification channel
///
/// Returns the sender (for the controller) and the receiver (for the host)
pub fn create_notification_channel(
    buffer_size: usize,
) -> (mpsc::Sender<Notification>, mpsc::Receiver<Notification>) {
    mpsc::channel(buffer_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = create_notification_channel(4);
        tx.notify(Notification::SequenceComplete);
        assert_eq!(rx.recv().await, Some(Notification::SequenceComplete));
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (tx, mut rx) = create_notification_channel(1);
        tx.notify(Notification::SequenceComplete);
        tx.notify(Notification::RelayCommand { command: "@OFF01$".to_string() });

        assert_eq!(rx.recv().await, Some(Notification::SequenceComplete));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let (tx, rx) = create_notification_channel(1);
        drop(rx);
        tx.notify(Notification::SequenceComplete);
        NullSink.notify(Notification::SequenceComplete);
    }
}
