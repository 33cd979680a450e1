//! Run-wide cancellation

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation flag shared by every worker of a run.
///
/// Clones observe the same flag. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct RunScope {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for RunScope {
    fn default() -> Self {
        Self::new()
    }
}

impl RunScope {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.flag.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives in `self`, so `changed` cannot fail while we wait
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let scope = RunScope::new();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scope.is_cancelled());
        scope.cancel();
        scope.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let scope = RunScope::new();
        scope.cancel();
        tokio::time::timeout(Duration::from_millis(100), scope.cancelled())
            .await
            .unwrap();
    }
}
