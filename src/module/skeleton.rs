//! Per-module event loop.
//!
//! A [`Skeleton`] drives one module on one task, multiplexing six event
//! sources:
//!
//! ```text
//!  shutdown signal ─┐
//!  async-call completions ─┤
//!  app chanrpc calls ─┼─► select! ─► handler(&mut Context<S>)
//!  command chanrpc calls ─┤
//!  offload completions ─┤
//!  fired timers ─┘
//! ```
//!
//! All handler and callback code for a module runs serialized on that
//! module's task; the [`Context`] owns the module state plus the
//! scheduling services, so handlers mutate state and schedule further work
//! without locks.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::chanrpc::{
    Args, CallId, Callback, Client, RetInfo, Server, ServerHandle, Value, DEFAULT_STACK_BUF_LEN,
};
use crate::error::Error;
use crate::pool::{worker_pool, WorkDone, WorkerPool};
use crate::timer::{dispatcher, CronExpr, Dispatcher, TimerFire, TimerHandle};

/// Capacities for one skeleton's event sources.
///
/// `go`, timers and async calls each require a positive capacity; using an
/// unconfigured facility is a programmer error and panics.
#[derive(Debug, Clone)]
pub struct SkeletonConfig {
    /// Application chanrpc command-channel capacity.
    pub chanrpc_len: usize,
    /// Internal command-server channel capacity.
    pub command_len: usize,
    /// Offload-pool completion capacity; 0 disables `go`.
    pub go_len: usize,
    /// Timer dispatcher capacity; 0 disables `after`/`cron`.
    pub timer_len: usize,
    /// Outstanding async-call cap; 0 disables `asyn_call`.
    pub asyn_call_len: usize,
    /// Panic stack snapshot bound; 0 disables snapshots.
    pub stack_buf_len: usize,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            chanrpc_len: 0,
            command_len: 0,
            go_len: 0,
            timer_len: 0,
            asyn_call_len: 0,
            stack_buf_len: DEFAULT_STACK_BUF_LEN,
        }
    }
}

/// The owner value handler closures receive: the module state plus the
/// scheduling surface.
pub struct Context<S> {
    /// The module's own state.
    pub state: S,
    client: Client<Context<S>>,
    pool: WorkerPool<Context<S>>,
    timer: Dispatcher<Context<S>>,
    go_len: usize,
    timer_len: usize,
    asyn_call_len: usize,
}

impl<S: Send + 'static> Context<S> {
    /// Async call to another module's server; `cb` runs back on this
    /// module's loop after the callee finishes. Above the configured cap
    /// the callback fires immediately with [`Error::TooManyCalls`].
    pub fn asyn_call(
        &mut self,
        server: &ServerHandle,
        id: CallId,
        args: Args,
        cb: Callback<Context<S>>,
    ) {
        assert!(
            self.asyn_call_len > 0,
            "asyn_call requires a positive asyn_call_len"
        );
        if self.client.over_capacity() {
            cb.run(self, Err(Error::TooManyCalls));
            return;
        }
        self.client.submit(server, id, args, cb);
    }

    /// Offload `work` to a blocking worker; `cb` runs back on this
    /// module's loop when it returns.
    pub fn go<W, F>(&mut self, work: W, cb: F)
    where
        W: FnOnce() + Send + 'static,
        F: FnOnce(&mut Context<S>) + Send + 'static,
    {
        assert!(self.go_len > 0, "go requires a positive go_len");
        self.pool.go(work, cb);
    }

    /// One-shot timer on this module's loop.
    pub fn after<F>(&mut self, d: Duration, cb: F) -> TimerHandle
    where
        F: FnOnce(&mut Context<S>) + Send + 'static,
    {
        assert!(self.timer_len > 0, "after requires a positive timer_len");
        self.timer.after(d, cb)
    }

    /// Recurring cron timer on this module's loop.
    pub fn cron<F>(&self, expr: CronExpr, cb: F) -> TimerHandle
    where
        F: Fn(&mut Context<S>) + Send + Sync + 'static,
    {
        assert!(self.timer_len > 0, "cron requires a positive timer_len");
        self.timer.cron(expr, cb)
    }

    /// Outstanding async calls.
    pub fn pending_asyn_calls(&self) -> usize {
        self.client.pending()
    }
}

/// Event loop and chanrpc servers for one module.
pub struct Skeleton<S> {
    cx: Context<S>,
    server: Server<Context<S>>,
    command_server: Server<Context<S>>,
    asyn_rx: mpsc::Receiver<RetInfo<Context<S>>>,
    pool_rx: mpsc::Receiver<WorkDone<Context<S>>>,
    timer_rx: mpsc::Receiver<TimerFire<Context<S>>>,
    stack_buf_len: usize,
}

impl<S: Send + 'static> Skeleton<S> {
    /// Build a skeleton around the module state.
    pub fn new(config: SkeletonConfig, state: S) -> Self {
        let (mut client, asyn_rx) = Client::new(config.asyn_call_len);
        client.set_stack_buf_len(config.stack_buf_len);
        let (mut pool, pool_rx) = worker_pool(config.go_len);
        pool.set_stack_buf_len(config.stack_buf_len);
        let (timer, timer_rx) = dispatcher(config.timer_len);

        let mut server = Server::new(config.chanrpc_len);
        server.set_stack_buf_len(config.stack_buf_len);
        let mut command_server = Server::new(config.command_len);
        command_server.set_stack_buf_len(config.stack_buf_len);

        Self {
            cx: Context {
                state,
                client,
                pool,
                timer,
                go_len: config.go_len,
                timer_len: config.timer_len,
                asyn_call_len: config.asyn_call_len,
            },
            server,
            command_server,
            asyn_rx,
            pool_rx,
            timer_rx,
            stack_buf_len: config.stack_buf_len,
        }
    }

    /// Register an application chanrpc function with no return value.
    pub fn register<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut Context<S>, Args) + Send + 'static,
    {
        self.server.register(id, f);
    }

    /// Register an application chanrpc function returning one value.
    pub fn register1<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut Context<S>, Args) -> Value + Send + 'static,
    {
        self.server.register1(id, f);
    }

    /// Register an application chanrpc function returning N values.
    pub fn register_n<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut Context<S>, Args) -> Vec<Value> + Send + 'static,
    {
        self.server.register_n(id, f);
    }

    /// Register an internal command (diagnostics, operations tooling).
    pub fn register_command<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut Context<S>, Args) -> Value + Send + 'static,
    {
        self.command_server.register1(id, f);
    }

    /// Caller-side handle to the application server.
    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Caller-side handle to the internal command server.
    pub fn command_handle(&self) -> ServerHandle {
        self.command_server.handle()
    }

    /// The context, for pre-run setup such as scheduling initial timers.
    pub fn context_mut(&mut self) -> &mut Context<S> {
        &mut self.cx
    }

    /// The module state.
    pub fn state(&self) -> &S {
        &self.cx.state
    }

    /// The module state, mutably.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.cx.state
    }

    /// Drive the module until the shutdown signal fires, then close both
    /// servers (queued calls fail with `ServerClosed`) and drain the pool
    /// and async-call completions until idle.
    pub async fn run(&mut self, shutdown: oneshot::Receiver<()>) {
        let Self {
            cx,
            server,
            command_server,
            asyn_rx,
            pool_rx,
            timer_rx,
            stack_buf_len,
        } = self;
        let stack_buf_len = *stack_buf_len;
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(ri) = asyn_rx.recv() => {
                    cx.client.note_completion();
                    ri.run(cx, stack_buf_len);
                }
                Some(ci) = server.recv() => server.exec(cx, ci),
                Some(ci) = command_server.recv() => command_server.exec(cx, ci),
                Some(done) = pool_rx.recv() => {
                    cx.pool.note_completion();
                    done.run(cx, stack_buf_len);
                }
                Some(fire) = timer_rx.recv() => fire.fire(cx, stack_buf_len),
            }
        }

        command_server.close();
        server.close();

        while !cx.pool.idle() || !cx.client.idle() {
            tokio::select! {
                Some(ri) = asyn_rx.recv(), if !cx.client.idle() => {
                    cx.client.note_completion();
                    ri.run(cx, stack_buf_len);
                }
                Some(done) = pool_rx.recv(), if !cx.pool.idle() => {
                    cx.pool.note_completion();
                    done.run(cx, stack_buf_len);
                }
                else => break,
            }
        }
    }
}
