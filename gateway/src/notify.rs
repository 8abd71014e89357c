//! Outbound notifications
//!
//! Forwards committed engine events to a [`Notifier`]. Failures and lag
//! here never touch committed state.

use async_trait::async_trait;
use dispatch::EngineEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Delivers engine events to the outside world.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &EngineEvent) -> anyhow::Result<()>;
}

/// Logs every event. Assignments are logged at info, the rest at debug.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &EngineEvent) -> anyhow::Result<()> {
        if event.is_assignment() {
            info!(
                sequence = event.sequence,
                responder_id = %event.subject_id,
                alert_id = ?event.responder.as_ref().and_then(|r| r.current_alert.as_deref()),
                "Notify responder of assignment"
            );
        } else {
            tracing::debug!(
                sequence = event.sequence,
                action = event.action.as_str(),
                subject_id = %event.subject_id,
                "Engine event"
            );
        }
        Ok(())
    }
}

/// Spawn the forwarding loop. Ends when the engine drops its sender.
pub fn spawn_notifier(
    mut events: broadcast::Receiver<EngineEvent>,
    notifier: Arc<dyn Notifier>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Notifier started");

        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = notifier.notify(&event).await {
                        warn!(sequence = event.sequence, "Notification failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Notifier lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, notifier stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledger::AuditAction;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, event: &EngineEvent) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.sequence);
            if event.sequence == 1 {
                anyhow::bail!("pager offline");
            }
            Ok(())
        }
    }

    fn event(sequence: u64) -> EngineEvent {
        EngineEvent {
            sequence,
            timestamp: Utc::now(),
            action: AuditAction::AlertCreated,
            actor_id: "reporter-1".into(),
            subject_id: "a-1".into(),
            alert: None,
            responder: None,
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_forwarding() {
        let (tx, rx) = broadcast::channel(8);
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_notifier(rx, recorder.clone());

        for seq in 0..3 {
            tx.send(event(seq)).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*recorder.seen.lock().await, vec![0, 1, 2]);
    }
}
