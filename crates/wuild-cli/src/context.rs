//! Process-wide run context: one shutdown flag, trip on SIGINT/SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

#[derive(Clone)]
pub struct AppContext {
    interrupted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AppContext {
    /// Create the context and install the signal hooks.
    pub fn install() -> Self {
        let context = Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        };

        let ctrl_c_context = context.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                ctrl_c_context.trip();
            }
        });

        #[cfg(unix)]
        {
            let term_context = context.clone();
            tokio::spawn(async move {
                let mut term = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
                if term.recv().await.is_some() {
                    info!("terminated");
                    term_context.trip();
                }
            });
        }

        context
    }

    pub fn trip(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Wait for the shutdown signal.
    pub async fn wait(&self) {
        loop {
            // Register before checking the flag, or a signal landing in
            // between would be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}
