//! Run-wide cancellation.
//!
//! Readers and workers are threads, and threads cannot be killed from the
//! outside. Every blocking point in the pipeline therefore polls a shared
//! [`CancelToken`]; raising it is how the orchestrator terminates its
//! children without waiting for the sentinel protocol to drain the queue.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared "stop now" flag.
///
/// A [`child`](Self::child) token sees its ancestors' cancellation but can be
/// cancelled on its own without affecting them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }
}

/// Raise `token` on the first Ctrl-C / SIGINT; exit the process on the second.
///
/// The listener runs a single-threaded tokio runtime on its own thread.
///
/// # Errors
/// Fails if the listener thread cannot be spawned.
pub fn install_interrupt_handler(token: CancelToken) -> Result<()> {
    thread::Builder::new()
        .name("interrupt-listener".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "cannot start signal runtime; Ctrl-C will not cancel cleanly"
                    );
                    return;
                }
            };
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::warn!("interrupted, terminating readers and workers");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::error!("second interrupt, exiting immediately");
                    std::process::exit(130);
                }
            });
        })
        .context("spawn interrupt listener")?;
    Ok(())
}
