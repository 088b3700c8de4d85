use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::info;

/// A process-wide cancellation point.
///
/// Every clone observes the same state; once terminated it never resets.
#[derive(Clone, Debug)]
pub struct FunctionSignal {
    is_terminating: Arc<watch::Sender<bool>>,
}

impl Default for FunctionSignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            is_terminating: Arc::new(tx),
        }
    }
}

impl FunctionSignal {
    pub fn trap_on_sigint(&self) -> Result<()> {
        let signal = self.clone();
        ::ctrlc::set_handler(move || signal.terminate())
            .map_err(|error| anyhow!("failed to set SIGINT handler: {error}"))
    }

    pub fn terminate(&self) {
        if !self.is_terminating.send_replace(true) {
            info!("Gracefully shutting down...");
        }
    }

    pub fn is_terminating(&self) -> bool {
        *self.is_terminating.borrow()
    }

    pub async fn wait_to_terminate(&self) {
        let mut rx = self.is_terminating.subscribe();
        // the sender lives as long as `self`, so this cannot be closed
        let _ = rx.wait_for(|is_terminating| *is_terminating).await;
    }
}
