//! Module lifecycle.
//!
//! A [`Module`] is a unit of application logic with ordered lifecycle
//! hooks; the [`Supervisor`] owns the process-wide module list.
//! Initialization runs in registration order, spawning one task per
//! module; teardown runs in reverse order - signal, await the task, then
//! `on_destroy` under a panic guard.

mod skeleton;

use std::panic::{self, AssertUnwindSafe};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::error;

use crate::chanrpc::DEFAULT_STACK_BUF_LEN;
use crate::trace::{log_panic, panic_message};

pub use skeleton::{Context, Skeleton, SkeletonConfig};

/// A unit of application logic with lifecycle hooks.
#[async_trait]
pub trait Module: Send + 'static {
    /// Called on the supervisor's task, in registration order, before any
    /// module runs.
    fn on_init(&mut self) {}

    /// The module's event loop. Must return soon after the shutdown signal
    /// fires.
    async fn run(&mut self, shutdown: oneshot::Receiver<()>);

    /// Called after the run loop has exited, in reverse registration
    /// order. Panics are contained and logged.
    fn on_destroy(&mut self) {}
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Box<dyn Module>>,
}

/// Process-wide ordered list of modules.
pub struct Supervisor {
    registered: Vec<Box<dyn Module>>,
    running: Vec<Running>,
    stack_buf_len: usize,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self {
            registered: Vec::new(),
            running: Vec::new(),
            stack_buf_len: DEFAULT_STACK_BUF_LEN,
        }
    }

    /// Bound the panic stack snapshot for contained `on_destroy` panics.
    pub fn set_stack_buf_len(&mut self, len: usize) {
        self.stack_buf_len = len;
    }

    /// Append a module; it initializes and destroys in list order.
    pub fn register(&mut self, module: impl Module) {
        self.registered.push(Box::new(module));
    }

    /// Initialize every registered module in order, then spawn one task
    /// per module running its event loop.
    pub fn init(&mut self) {
        let mut modules: Vec<Box<dyn Module>> = self.registered.drain(..).collect();
        for m in &mut modules {
            m.on_init();
        }
        for mut m in modules {
            let (stop, rx) = oneshot::channel();
            let task = tokio::spawn(async move {
                m.run(rx).await;
                m
            });
            self.running.push(Running { stop, task });
        }
    }

    /// Tear down in reverse order: send each module's shutdown signal,
    /// wait for its task to exit, then run `on_destroy` under a panic
    /// guard.
    pub async fn destroy(&mut self) {
        while let Some(Running { stop, task }) = self.running.pop() {
            let _ = stop.send(());
            match task.await {
                Ok(mut module) => {
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| module.on_destroy()));
                    if let Err(payload) = outcome {
                        let msg = panic_message(payload.as_ref());
                        log_panic("module on_destroy", &msg, self.stack_buf_len);
                    }
                }
                Err(e) => error!("module run loop aborted: {e}"),
            }
        }
    }
}
