use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What an interrupt did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptOutcome {
    /// First interrupt: shutdown has begun.
    ShutdownRequested,
    /// Shutdown was already under way; the interrupt was absorbed.
    AlreadyShuttingDown,
}

/// Turns external interrupts into one cooperative shutdown.
///
/// Every driver, dispatcher and worker slot watches a child of this
/// controller's token. Repeated interrupts never escalate; they are counted
/// and logged so teardown can finish.
#[derive(Debug, Default)]
pub struct CancellationController {
    token: CancellationToken,
    interrupts: AtomicUsize,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) -> InterruptOutcome {
        let previous = self.interrupts.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            info!(target: "dnsprobe::shutdown", "interrupt received; shutting down");
            self.token.cancel();
            InterruptOutcome::ShutdownRequested
        } else {
            warn!(
                target: "dnsprobe::shutdown",
                interrupts = previous + 1,
                "interrupt received during shutdown; ignoring"
            );
            InterruptOutcome::AlreadyShuttingDown
        }
    }

    /// Feeds Ctrl-C (and SIGTERM on unix) into [`Self::interrupt`] until the
    /// returned task is aborted. Listener failures are logged and end the
    /// listener; they never reach the caller.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match next_signal().await {
                    Ok(signal) => {
                        info!(target: "dnsprobe::shutdown", signal, "signal received");
                        controller.interrupt();
                    }
                    Err(err) => {
                        warn!(target: "dnsprobe::shutdown", error = %err, "signal listener failed");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
