//! In-process channel RPC.
//!
//! A [`Server`] is a named table of functions plus one bounded command
//! channel. All registered functions execute on exactly one consumer task
//! (the server's owner, typically a module's event loop), so handler code
//! may freely touch the owner's state without locks. The owner state is the
//! generic parameter `T`: every handler receives `&mut T`.
//!
//! ```text
//! Caller task A ─┐
//! Caller task B ─┼─► mpsc::Sender<CallInfo> ─► owner loop ─► exec(&mut T)
//! Caller task C ─┘                                │
//!        ▲                                        │ result
//!        └──────────── return sink ◄──────────────┘
//! ```
//!
//! # Invocation modes
//!
//! | Mode        | Enqueue       | Result delivery                       |
//! |-------------|---------------|---------------------------------------|
//! | `go`        | non-blocking  | fire-and-forget                       |
//! | `call0/1/n` | blocking      | awaited on a per-call return channel  |
//! | `asyn_call` | non-blocking  | posted to the caller's return channel; the caller's loop runs the callback |
//!
//! Calls enqueued from a single task execute in enqueue order; no ordering
//! is guaranteed across tasks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::trace::{log_panic, panic_message};

/// Default bound for panic stack snapshots.
pub const DEFAULT_STACK_BUF_LEN: usize = 4096;

/// Identifier of a registered function.
pub type CallId = &'static str;

/// A positional argument or return value. Handlers downcast to the concrete
/// types agreed between caller and callee.
pub type Value = Box<dyn Any + Send>;

/// Positional call arguments.
pub type Args = Vec<Value>;

/// Return arity of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// `fn(&mut T, Args)`
    None,
    /// `fn(&mut T, Args) -> Value`
    One,
    /// `fn(&mut T, Args) -> Vec<Value>`
    Many,
}

/// A produced return value, shaped by the function's arity.
pub enum Ret {
    /// No return value.
    None,
    /// A single value.
    One(Value),
    /// N values.
    Many(Vec<Value>),
}

enum Func<T> {
    NoRet(Box<dyn FnMut(&mut T, Args) + Send>),
    OneRet(Box<dyn FnMut(&mut T, Args) -> Value + Send>),
    ManyRet(Box<dyn FnMut(&mut T, Args) -> Vec<Value> + Send>),
}

impl<T> Func<T> {
    fn arity(&self) -> Arity {
        match self {
            Func::NoRet(_) => Arity::None,
            Func::OneRet(_) => Arity::One,
            Func::ManyRet(_) => Arity::Many,
        }
    }
}

/// One-shot delivery of a call result back to the caller.
type RetSink = Box<dyn FnOnce(Result<Ret>) + Send>;

/// A queued invocation: the function id, the positional arguments, and -
/// for return-bearing calls - the sink that delivers the result.
pub struct CallInfo {
    id: CallId,
    args: Args,
    ret: Option<RetSink>,
}

fn deliver(ret: Option<RetSink>, r: Result<Ret>) {
    if let Some(sink) = ret {
        sink(r);
    }
}

/// The consumer side of a chanrpc server: the function table and the
/// command-channel receiver. Owned by exactly one task.
pub struct Server<T> {
    functions: HashMap<CallId, Func<T>>,
    tx: mpsc::Sender<CallInfo>,
    rx: mpsc::Receiver<CallInfo>,
    stack_buf_len: usize,
}

impl<T> Server<T> {
    /// Create a server with the given command-channel capacity.
    ///
    /// Capacity is clamped to at least 1 (tokio channels have no
    /// rendezvous mode).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            functions: HashMap::new(),
            tx,
            rx,
            stack_buf_len: DEFAULT_STACK_BUF_LEN,
        }
    }

    /// Bound the panic stack snapshot captured when a handler panics.
    /// Zero disables the snapshot.
    pub fn set_stack_buf_len(&mut self, len: usize) {
        self.stack_buf_len = len;
    }

    fn insert(&mut self, id: CallId, f: Func<T>) {
        // Registration is one-shot and happens before the server starts;
        // a duplicate is a startup programming error.
        if self.functions.contains_key(id) {
            panic!("chanrpc function {id:?} already registered");
        }
        self.functions.insert(id, f);
    }

    /// Register a function with no return value.
    pub fn register<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut T, Args) + Send + 'static,
    {
        self.insert(id, Func::NoRet(Box::new(f)));
    }

    /// Register a function returning one value.
    pub fn register1<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut T, Args) -> Value + Send + 'static,
    {
        self.insert(id, Func::OneRet(Box::new(f)));
    }

    /// Register a function returning N values.
    pub fn register_n<F>(&mut self, id: CallId, f: F)
    where
        F: FnMut(&mut T, Args) -> Vec<Value> + Send + 'static,
    {
        self.insert(id, Func::ManyRet(Box::new(f)));
    }

    /// Snapshot a cloneable caller-side handle. Call after all
    /// registrations are done.
    pub fn handle(&self) -> ServerHandle {
        let meta: HashMap<CallId, Arity> = self
            .functions
            .iter()
            .map(|(id, f)| (*id, f.arity()))
            .collect();
        ServerHandle {
            tx: self.tx.clone(),
            meta: Arc::new(meta),
        }
    }

    /// Receive the next queued call. `None` once the channel is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<CallInfo> {
        self.rx.recv().await
    }

    /// Execute one call on the owner task.
    ///
    /// Panics in the handler are caught: the panic is logged with a bounded
    /// stack snapshot and, when the caller expects a return, reported as
    /// [`Error::Handler`]. The server keeps running.
    pub fn exec(&mut self, owner: &mut T, ci: CallInfo) {
        let Some(f) = self.functions.get_mut(ci.id) else {
            deliver(ci.ret, Err(Error::FunctionNotFound(ci.id)));
            return;
        };

        let args = ci.args;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match f {
            Func::NoRet(f) => {
                f(owner, args);
                Ret::None
            }
            Func::OneRet(f) => Ret::One(f(owner, args)),
            Func::ManyRet(f) => Ret::Many(f(owner, args)),
        }));

        match outcome {
            Ok(ret) => deliver(ci.ret, Ok(ret)),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log_panic("chanrpc handler", &msg, self.stack_buf_len);
                deliver(ci.ret, Err(Error::Handler(msg)));
            }
        }
    }

    /// Close the command channel. Queued calls are drained and fail with
    /// [`Error::ServerClosed`].
    pub fn close(&mut self) {
        self.rx.close();
        while let Ok(ci) = self.rx.try_recv() {
            deliver(ci.ret, Err(Error::ServerClosed));
        }
    }
}

/// Cloneable caller-side handle to a [`Server`].
///
/// Carries the command-channel sender plus an id-to-arity table snapshotted
/// at [`Server::handle`] time for call-shape validation.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<CallInfo>,
    meta: Arc<HashMap<CallId, Arity>>,
}

impl ServerHandle {
    fn check(&self, id: CallId, want: Option<Arity>) -> Result<()> {
        match self.meta.get(id) {
            None => Err(Error::FunctionNotFound(id)),
            Some(a) => match want {
                Some(w) if *a != w => Err(Error::ArityMismatch(id)),
                _ => Ok(()),
            },
        }
    }

    /// Fire-and-forget invocation; non-blocking enqueue.
    ///
    /// Unknown id, a full channel and a closed server are explicit errors;
    /// this never panics.
    pub fn go(&self, id: CallId, args: Args) -> Result<()> {
        self.check(id, None)?;
        self.tx
            .try_send(CallInfo {
                id,
                args,
                ret: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => Error::ServerClosed,
            })
    }

    async fn call(&self, id: CallId, args: Args) -> Result<Ret> {
        let (tx, rx) = oneshot::channel();
        let sink: RetSink = Box::new(move |r| {
            let _ = tx.send(r);
        });
        self.tx
            .send(CallInfo {
                id,
                args,
                ret: Some(sink),
            })
            .await
            .map_err(|_| Error::ServerClosed)?;
        rx.await.map_err(|_| Error::ServerClosed)?
    }

    /// Synchronous call with no return value: blocking enqueue, then wait
    /// for completion.
    pub async fn call0(&self, id: CallId, args: Args) -> Result<()> {
        self.check(id, Some(Arity::None))?;
        self.call(id, args).await.map(|_| ())
    }

    /// Synchronous call returning one value.
    pub async fn call1(&self, id: CallId, args: Args) -> Result<Value> {
        self.check(id, Some(Arity::One))?;
        match self.call(id, args).await? {
            Ret::One(v) => Ok(v),
            _ => Err(Error::ArityMismatch(id)),
        }
    }

    /// Synchronous call returning N values.
    pub async fn call_n(&self, id: CallId, args: Args) -> Result<Vec<Value>> {
        self.check(id, Some(Arity::Many))?;
        match self.call(id, args).await? {
            Ret::Many(vs) => Ok(vs),
            _ => Err(Error::ArityMismatch(id)),
        }
    }
}

/// Completion callback for an async call, run on the caller's own loop.
///
/// The variant fixes the expected result arity; a mismatch against the
/// registered function is reported through the callback as
/// [`Error::ArityMismatch`].
pub enum Callback<T> {
    /// Expects no return value.
    NoRet(Box<dyn FnOnce(&mut T, Result<()>) + Send>),
    /// Expects one value.
    OneRet(Box<dyn FnOnce(&mut T, Result<Value>) + Send>),
    /// Expects N values.
    ManyRet(Box<dyn FnOnce(&mut T, Result<Vec<Value>>) + Send>),
}

impl<T> Callback<T> {
    /// Callback expecting no return value.
    pub fn none<F>(f: F) -> Self
    where
        F: FnOnce(&mut T, Result<()>) + Send + 'static,
    {
        Callback::NoRet(Box::new(f))
    }

    /// Callback expecting one value.
    pub fn one<F>(f: F) -> Self
    where
        F: FnOnce(&mut T, Result<Value>) + Send + 'static,
    {
        Callback::OneRet(Box::new(f))
    }

    /// Callback expecting N values.
    pub fn many<F>(f: F) -> Self
    where
        F: FnOnce(&mut T, Result<Vec<Value>>) + Send + 'static,
    {
        Callback::ManyRet(Box::new(f))
    }

    fn arity(&self) -> Arity {
        match self {
            Callback::NoRet(_) => Arity::None,
            Callback::OneRet(_) => Arity::One,
            Callback::ManyRet(_) => Arity::Many,
        }
    }

    pub(crate) fn run(self, owner: &mut T, ret: Result<Ret>) {
        match self {
            Callback::NoRet(f) => f(owner, ret.map(|_| ())),
            Callback::OneRet(f) => f(
                owner,
                ret.and_then(|r| match r {
                    Ret::One(v) => Ok(v),
                    _ => Err(Error::ArityMismatch("callback")),
                }),
            ),
            Callback::ManyRet(f) => f(
                owner,
                ret.and_then(|r| match r {
                    Ret::Many(vs) => Ok(vs),
                    _ => Err(Error::ArityMismatch("callback")),
                }),
            ),
        }
    }
}

/// A completed async call travelling back to its caller.
pub struct RetInfo<T> {
    ret: Result<Ret>,
    cb: Callback<T>,
}

impl<T> RetInfo<T> {
    /// Run the callback on the owner loop with panic containment.
    pub(crate) fn run(self, owner: &mut T, stack_buf_len: usize) {
        let RetInfo { ret, cb } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| cb.run(owner, ret)));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            log_panic("asyn-call callback", &msg, stack_buf_len);
        }
    }
}

/// The async-call side of one caller loop. One client per owner task.
///
/// Outstanding calls are bounded by the construction capacity; above it,
/// calls fail immediately via their callback with [`Error::TooManyCalls`].
pub struct Client<T> {
    tx: mpsc::Sender<RetInfo<T>>,
    pending: usize,
    cap: usize,
    stack_buf_len: usize,
}

impl<T: 'static> Client<T> {
    /// Create a client and its completion receiver. The receiver must be
    /// polled by the owner loop.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RetInfo<T>>) {
        let cap = capacity.max(1);
        let (tx, rx) = mpsc::channel(cap);
        (
            Self {
                tx,
                pending: 0,
                cap,
                stack_buf_len: DEFAULT_STACK_BUF_LEN,
            },
            rx,
        )
    }

    /// Bound the panic stack snapshot for callback panics.
    pub fn set_stack_buf_len(&mut self, len: usize) {
        self.stack_buf_len = len;
    }

    /// Number of async calls whose completion has not yet been dispatched.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True when no async calls are outstanding.
    pub fn idle(&self) -> bool {
        self.pending == 0
    }

    /// True once the outstanding-call count has reached capacity.
    pub(crate) fn over_capacity(&self) -> bool {
        self.pending >= self.cap
    }

    /// Account for one dispatched completion.
    pub(crate) fn note_completion(&mut self) {
        self.pending -= 1;
    }

    /// Issue an async call. Never blocks: above capacity the callback runs
    /// immediately with [`Error::TooManyCalls`]; enqueue failures are
    /// delivered through the completion channel like any other result.
    pub fn asyn_call(
        &mut self,
        owner: &mut T,
        server: &ServerHandle,
        id: CallId,
        args: Args,
        cb: Callback<T>,
    ) {
        if self.over_capacity() {
            cb.run(owner, Err(Error::TooManyCalls));
            return;
        }
        self.submit(server, id, args, cb);
    }

    /// Enqueue an async call without the capacity check; the caller has
    /// already established there is room.
    pub(crate) fn submit(&mut self, server: &ServerHandle, id: CallId, args: Args, cb: Callback<T>) {
        if let Err(e) = server.check(id, Some(cb.arity())) {
            // Reserved slot below capacity, so the completion channel has
            // room for the failure.
            let _ = self.tx.try_send(RetInfo { ret: Err(e), cb });
            self.pending += 1;
            return;
        }

        let tx = self.tx.clone();
        let sink: RetSink = Box::new(move |ret| {
            let _ = tx.try_send(RetInfo { ret, cb });
        });

        let ci = CallInfo {
            id,
            args,
            ret: Some(sink),
        };
        match server.tx.try_send(ci) {
            Ok(()) => {}
            Err(e) => {
                let (ci, err) = match e {
                    mpsc::error::TrySendError::Full(ci) => (ci, Error::ChannelFull),
                    mpsc::error::TrySendError::Closed(ci) => (ci, Error::ServerClosed),
                };
                deliver(ci.ret, Err(err));
            }
        }
        self.pending += 1;
    }

    /// Dispatch one completion on the owner loop: decrement the outstanding
    /// count and run the callback. Callback panics are contained.
    pub fn dispatch(&mut self, owner: &mut T, ri: RetInfo<T>) {
        self.note_completion();
        ri.run(owner, self.stack_buf_len);
    }

    /// Drain every outstanding completion before returning.
    pub async fn close(&mut self, owner: &mut T, rx: &mut mpsc::Receiver<RetInfo<T>>) {
        while self.pending > 0 {
            match rx.recv().await {
                Some(ri) => self.dispatch(owner, ri),
                None => break,
            }
        }
    }
}
