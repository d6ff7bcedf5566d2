//! Shared cancellation signal for tearing the fabric down.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable shutdown flag.
///
/// Every long-running task selects on [`Shutdown::cancelled`] at each point
/// where it may suspend, so once triggered the whole fabric stops at its next
/// receive or send.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this only
        // returns once the flag is set.
        let _ = rx.wait_for(|&fired| fired).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
