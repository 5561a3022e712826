//! Cancellable background tasks.

use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct TokenInner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `signal` and wakes any `select!`.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Shared cancellation flag that can also be waited on in `select!`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once cancelled.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A named worker thread paired with its cancellation token.
///
/// Dropping the handle detaches the thread; call [`TaskHandle::cancel`] and
/// [`TaskHandle::join`] to stop it deterministically.
pub struct TaskHandle<T> {
    token: CancellationToken,
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `f` on a new thread. The closure receives the task's token.
    pub fn spawn<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(task_token))?;
        Ok(Self { token, thread })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the thread. Returns `None` if it panicked.
    pub fn join(self) -> Option<T> {
        self.thread.join().ok()
    }
}

/// Run a blocking call on a helper thread, giving up on cancellation or
/// after `timeout`.
///
/// The helper thread is detached when the wait is abandoned; its result is
/// dropped.
pub fn run_with_timeout<T, F>(token: &CancellationToken, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("readtrack-io".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    select! {
        recv(rx) -> result => match result {
            Ok(result) => result,
            Err(_) => Err(SyncError::TransientNetwork("worker exited without a result".into())),
        },
        recv(token.signal()) -> _ => Err(SyncError::Cancelled),
        default(timeout) => Err(SyncError::Timeout(timeout)),
    }
}
