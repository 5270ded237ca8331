use tokio::sync::broadcast;

use super::{BoxFuture, CollabError, Notification, Notifier};
use crate::state::AnalysisId;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Push notifications over a broadcast channel.
///
/// Sending with no subscriber is not an error; slow subscribers lag and
/// lose the oldest messages rather than blocking the pipeline.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<(AnalysisId, Notification)>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(AnalysisId, Notification)> {
        self.tx.subscribe()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, id: AnalysisId, notification: Notification) -> BoxFuture<'_, Result<(), CollabError>> {
        // Err only means there are no receivers right now
        let _ = self.tx.send((id, notification));
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = ChannelNotifier::default();
        let mut rx = notifier.subscribe();
        let id = AnalysisId::new();

        notifier.notify(id, Notification::IocFound { count: 3 }).await.unwrap();
        notifier.notify(id, Notification::Error { message: "boom".into() }).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), (id, Notification::IocFound { count: 3 }));
        assert!(matches!(rx.recv().await.unwrap().1, Notification::Error { .. }));
    }

    #[tokio::test]
    async fn test_no_subscriber_is_ok() {
        let notifier = ChannelNotifier::new(4);
        assert!(notifier.notify(AnalysisId::new(), Notification::IocFound { count: 0 }).await.is_ok());
    }
}
