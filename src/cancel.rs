// Cooperative cancellation shared by the stream consumer and the upload
// pipeline. Cancelling drops the only sender of a zero-capacity channel,
// so every receiver blocked in a `select!` wakes up at once. That is what
// lets a multi-minute backoff or poll wait end as soon as the operator
// presses Ctrl+C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};

/// Result of an interruptible wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Elapsed,
    Cancelled,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
    signal: Receiver<()>,
}

struct Inner {
    cancelled: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
            }),
            signal: rx,
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let sender = match self.inner.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A receiver that becomes ready (disconnected) once the token fires.
    /// Include it in a `select!` to make any blocking receive cancellable.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleep for `timeout` unless cancelled first.
    pub fn wait(&self, timeout: Duration) -> Wait {
        if self.is_cancelled() {
            return Wait::Cancelled;
        }
        select! {
            recv(self.signal) -> _ => Wait::Cancelled,
            default(timeout) => Wait::Elapsed,
        }
    }
}

/// Cancel `token` on the first Ctrl+C. A second Ctrl+C exits right away.
///
/// The signal is watched from a small dedicated thread running a
/// current-thread tokio runtime; the rest of the crate stays blocking.
pub fn install_interrupt_handler(token: CancelToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("ctw-interrupt".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::info!("interrupt received, stopping");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        })?;
    Ok(())
}
