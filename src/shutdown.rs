use tokio::sync::watch;
use tracing::{error, info};

/// 关机信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 程序内部触发的关机
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Process-wide stop flag. Monitors, the aggregator, the consumer and the
/// ingestion server each hold a receiver.
pub struct Shutdown {
    stop_tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { stop_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Flips the stop flag. Later calls are no-ops.
    pub fn trigger(&self, signal: ShutdownSignal) {
        let changed = self.stop_tx.send_if_modified(|stopped| {
            let first = !*stopped;
            *stopped = true;
            first
        });
        if changed {
            info!("Shutting down due to signal: {}", signal);
        }
    }

    /// Resolves once the stop flag is set.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only ends on a flip.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// 等待关机信号 (SIGINT / SIGTERM)
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let signal = tokio::select! {
            signal = interrupt() => signal,
            signal = terminate() => signal,
            _ = self.triggered() => ShutdownSignal::Internal,
        };
        self.trigger(signal);
        signal
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn interrupt() -> ShutdownSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}

#[cfg(unix)]
async fn terminate() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
    ShutdownSignal::Terminate
}

#[cfg(not(unix))]
async fn terminate() -> ShutdownSignal {
    std::future::pending::<()>().await;
    ShutdownSignal::Terminate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers_once() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        shutdown.trigger(ShutdownSignal::Internal);
        shutdown.trigger(ShutdownSignal::Terminate);

        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(!rx.has_changed().unwrap());
        assert!(shutdown.is_triggered());

        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .unwrap();
    }
}
