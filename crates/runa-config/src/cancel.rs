// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tokio::sync::watch;

/// Idempotent cancellation handle shared across one turn.
///
/// One token governs a turn: the chat session, the tool scheduler, and every
/// tool invocation clone the same token.  Cancelling twice is a no-op; the
/// flag only ever transitions from false to true.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Trip the token.  Idempotent.
    pub fn cancel(&self) {
        // send_replace never fails even when all receivers are dropped,
        // which is what makes double-cancel and late-cancel harmless.
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the token is tripped.  Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives inside self, so changed() can only fail after
        // self is dropped, at which point nobody is awaiting.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untripped() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_trips_all_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        t.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let t = CancelToken::new();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trip() {
        let t = CancelToken::new();
        let c = t.clone();
        let waiter = tokio::spawn(async move { c.cancelled().await });
        t.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_tripped() {
        let t = CancelToken::new();
        t.cancel();
        // Must not hang.
        t.cancelled().await;
    }
}
