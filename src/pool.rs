//! Offload pool.
//!
//! `go(work, cb)` runs `work` on a blocking worker thread; when it returns,
//! `cb` is delivered to the owner loop and runs there, preserving the
//! single-task state discipline. Panics in either closure are contained.

use tokio::sync::mpsc;
use tracing::debug;

use crate::trace::{log_panic, panic_message};

/// A finished piece of offloaded work travelling to its owner loop.
pub struct WorkDone<T> {
    cb: Box<dyn FnOnce(&mut T) + Send>,
}

impl<T> WorkDone<T> {
    /// Run the continuation on the owner loop with panic containment.
    pub fn run(self, owner: &mut T, stack_buf_len: usize) {
        let cb = self.cb;
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(owner)));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            log_panic("offload continuation", &msg, stack_buf_len);
        }
    }
}

/// Producer side of one owner loop's offload pool.
pub struct WorkerPool<T> {
    tx: mpsc::Sender<WorkDone<T>>,
    pending: usize,
    stack_buf_len: usize,
}

/// Create a pool and its completion receiver. The receiver must be polled
/// by the owner loop.
pub fn worker_pool<T: Send + 'static>(
    capacity: usize,
) -> (WorkerPool<T>, mpsc::Receiver<WorkDone<T>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        WorkerPool {
            tx,
            pending: 0,
            stack_buf_len: crate::chanrpc::DEFAULT_STACK_BUF_LEN,
        },
        rx,
    )
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Bound the panic stack snapshot for contained panics.
    pub fn set_stack_buf_len(&mut self, len: usize) {
        self.stack_buf_len = len;
    }

    /// Number of offloaded jobs whose continuation has not yet run.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True when no offloaded work is outstanding.
    pub fn idle(&self) -> bool {
        self.pending == 0
    }

    /// Offload `work`; run `cb` back on the owner loop when it finishes.
    /// The continuation is delivered even if `work` panics.
    pub fn go<W, F>(&mut self, work: W, cb: F)
    where
        W: FnOnce() + Send + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.pending += 1;
        let tx = self.tx.clone();
        let stack_buf_len = self.stack_buf_len;
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    let msg = panic_message(payload.as_ref());
                    log_panic("offloaded work", &msg, stack_buf_len);
                }
                Err(e) => debug!("offloaded work cancelled: {e}"),
            }
            let _ = tx.send(WorkDone { cb: Box::new(cb) }).await;
        });
    }

    /// Account for one dispatched completion.
    pub(crate) fn note_completion(&mut self) {
        self.pending -= 1;
    }

    /// Dispatch one completion on the owner loop.
    pub fn dispatch(&mut self, owner: &mut T, done: WorkDone<T>) {
        self.note_completion();
        done.run(owner, self.stack_buf_len);
    }
}
