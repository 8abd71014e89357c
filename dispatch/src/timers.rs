//! Acknowledgment timers.

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::debug;

/// One armed timer per alert, tagged with the alert version it was armed at.
#[derive(Debug, Default)]
pub struct AckTimers {
    armed: DashMap<String, (u64, AbortHandle)>,
}

impl AckTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a timer task, aborting any previous one for the alert.
    pub fn arm(&self, alert_id: &str, version: u64, handle: AbortHandle) {
        if let Some((_, (old_version, old))) = self.armed.remove(alert_id) {
            debug!(alert_id, old_version, "Replacing acknowledgment timer");
            old.abort();
        }
        self.armed.insert(alert_id.to_string(), (version, handle));
    }

    /// Abort the alert's timer, if any.
    pub fn cancel(&self, alert_id: &str) {
        if let Some((_, (version, handle))) = self.armed.remove(alert_id) {
            debug!(alert_id, version, "Acknowledgment timer cancelled");
            handle.abort();
        }
    }

    /// Abort every timer, returning how many were armed.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.armed.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.cancel(id);
        }
        ids.len()
    }

    /// Forget a fired timer without aborting it; called from the timer task.
    pub fn disarm(&self, alert_id: &str, version: u64) {
        self.armed.remove_if(alert_id, |_, (v, _)| *v == version);
    }

    pub fn is_armed(&self, alert_id: &str) -> bool {
        self.armed.contains_key(alert_id)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
