//! Gate that lets a writer quiesce the reader task.
//!
//! The gate has its own synchronization, disjoint from the connection lock,
//! so [`PauseGate::unpause`] can be called while the connection lock is held
//! without deadlocking against a parked reader.

use tokio::sync::watch;

#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: watch::Sender::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Set the paused flag without waiting. The reader arms the gate before
    /// delivering a reply that requests a pause, so the caller reacting to
    /// that reply cannot unpause too early.
    pub(crate) fn arm(&self) {
        self.paused.send_replace(true);
    }

    /// Clear the paused flag and wake the reader. No-op if not paused.
    pub fn unpause(&self) {
        let woke = self.paused.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if woke {
            tracing::debug!("pause gate released");
        }
    }

    /// Park until [`PauseGate::unpause`] is called. Reader only.
    ///
    /// Waits until the gate is open. The flag is checked and waited on through
    /// the same channel, so an unpause in between is never missed.
    pub(crate) async fn wait(&self) {
        let mut rx = self.paused.subscribe();
        tracing::debug!("reader paused");
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|paused| !*paused).await;
        tracing::debug!("reader resumed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn unpause_without_pause_is_noop() {
        let gate = PauseGate::new();
        gate.unpause();
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn pause_blocks_until_unpaused() {
        let gate = Arc::new(PauseGate::new());
        let reader = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.arm();
                gate.wait().await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.is_paused());
        assert!(!reader.is_finished());
        gate.unpause();
        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader stayed parked")
            .unwrap();
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn unpause_between_arm_and_wait_is_not_lost() {
        let gate = PauseGate::new();
        gate.arm();
        gate.unpause();
        tokio::time::timeout(Duration::from_secs(5), gate.wait())
            .await
            .expect("wakeup was lost");
    }
}
