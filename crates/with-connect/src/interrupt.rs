//! External interruption (Ctrl-C, SIGTERM) as a cancellation handle.

use log::info;
use tokio_util::sync::CancellationToken;

/// Shared flag raised once when the process is asked to stop.
///
/// Cloning is cheap; all clones observe the same trigger.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    /// A handle that only fires when [`Interrupt::trigger`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle fed by Ctrl-C and, on Unix, SIGTERM.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install() -> Self {
        let interrupt = Self::new();
        let token = interrupt.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => {
                    info!("Interrupt received, shutting down...");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        interrupt
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the interrupt fires. Returns immediately if it already has.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
