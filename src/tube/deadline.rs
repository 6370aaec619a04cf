//! Absolute deadlines that can be moved while someone is waiting on them

use tokio::sync::watch;
use tokio::time::Instant;

/// A settable deadline. `None` means no deadline.
#[derive(Debug)]
pub struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.get().map_or(false, |at| Instant::now() >= at)
    }

    /// Resolves once the deadline has passed, following any updates made
    /// while waiting. Never resolves while no deadline is set.
    pub async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_expires_at_instant() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now() + Duration::from_millis(100)));
        assert!(!deadline.is_expired());

        let start = Instant::now();
        deadline.expired().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_updates() {
        let deadline = std::sync::Arc::new(Deadline::new());
        let waiter = {
            let deadline = deadline.clone();
            tokio::spawn(async move { deadline.expired().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        deadline.set(Some(Instant::now()));
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_never_fires() {
        let deadline = Deadline::new();
        let result = tokio::time::timeout(Duration::from_secs(3600), deadline.expired()).await;
        assert!(result.is_err());
    }
}
