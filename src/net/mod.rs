//! Network module - framed connections and their supervisors.
//!
//! Two interchangeable transports present one uniform contract: read one
//! message, write one message.
//!
//! - [`TcpConn`] / [`TcpServer`] / [`TcpClient`] - length-prefixed TCP.
//! - [`WsConn`] / [`WsServer`] / [`WsClient`] - WebSocket binary frames.
//!
//! Every connection is served by two tasks: the application's reader loop
//! (the agent) and a dedicated writer task draining a bounded outbound
//! queue. Writes are synchronous enqueues callable from any task through a
//! cloneable [`ConnHandle`]; if the queue is full at the moment of a write
//! the connection is destroyed - with fire-and-forget messaging there is no
//! way to push backpressure to the peer, and silently dropping messages
//! would corrupt the stream.

mod table;
mod tcp_client;
mod tcp_conn;
mod tcp_server;
mod ws_client;
mod ws_conn;
mod ws_server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub(crate) use table::{Admit, ConnTable};
pub use tcp_client::TcpClient;
pub use tcp_conn::TcpConn;
pub use tcp_server::{TcpAgentFactory, TcpServer};
pub use ws_client::WsClient;
pub use ws_conn::WsConn;
pub use ws_server::{WsAgentFactory, WsServer};

/// Erased byte stream: anything a framed connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Control surface of a connection, callable from any task.
pub trait ConnCtl: Send + Sync {
    /// Enqueue one message built from `parts`. Silently ignored after
    /// close; a full outbound queue destroys the connection.
    fn write_msg(&self, parts: &[&[u8]]) -> Result<()>;

    /// Graceful close: the writer drains queued messages first.
    fn close(&self);

    /// Forceful close: queued messages are dropped, reader and writer exit.
    fn destroy(&self);

    /// Local socket address, when known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer address. For WebSocket servers behind a proxy this is the
    /// forwarded client IP (port 0).
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// True once the connection is closed or destroyed.
    fn is_closed(&self) -> bool;
}

/// Cloneable write/close handle to a connection.
pub type ConnHandle = Arc<dyn ConnCtl>;

/// The read side of a connection. Owned by exactly one reader task; writes
/// go through [`Conn::ctl`].
#[async_trait]
pub trait Conn: Send {
    /// Read the next message. Any error means the connection is done and
    /// the reader loop must exit.
    async fn read_msg(&mut self) -> Result<Bytes>;

    /// The connection's control handle.
    fn ctl(&self) -> ConnHandle;
}

/// Per-connection application logic, driven to completion by the reader
/// task the supervisor spawns.
#[async_trait]
pub trait Agent: Send + 'static {
    /// The agent's main loop; returns when the connection is done.
    async fn run(&mut self);

    /// Called after the reader loop exits and the connection is closed.
    async fn on_close(&mut self);
}

/// Accept-loop backoff: 5 ms doubling to a 1 s cap; reset to zero on the
/// first successful accept.
pub(crate) fn next_accept_delay(current: Duration) -> Duration {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);
    if current.is_zero() {
        INITIAL
    } else {
        (current * 2).min(MAX)
    }
}
