//! Cooperative cancellation over a `tokio::sync::watch` channel.
//!
//! A [`CancelHandle`] flips the flag once; every cloned [`CancelToken`]
//! observes it. Long-running work checks [`CancelToken::is_canceled`] at
//! safe points or awaits [`CancelToken::canceled`] inside `select!`.

use tokio::sync::watch;

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never canceled.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once canceled. Pends forever if the handle is dropped uncanceled.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_is_observed_by_clones() {
        let (handle, token) = cancel_pair();
        let clone = token.clone();
        assert!(!clone.is_canceled());
        handle.cancel();
        assert!(clone.is_canceled());
        tokio::time::timeout(Duration::from_secs(1), token.canceled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn never_token_does_not_resolve() {
        let token = CancelToken::never();
        assert!(!token.is_canceled());
        let waited = tokio::time::timeout(Duration::from_millis(50), token.canceled()).await;
        assert!(waited.is_err());
    }
}
