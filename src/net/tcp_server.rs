//! TCP accept supervisor.
//!
//! One accept task per server. Transient accept failures back off
//! exponentially (5 ms doubling to a 1 s cap, reset on success). Admission
//! happens under the connection-table lock: at the cap the new socket is
//! dropped before the agent factory runs. Each admitted connection gets one
//! reader task running the agent to completion, then cleanup: close the
//! connection, remove it from the table, run `on_close`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::codec::FrameCodec;
use crate::error::Result;

use super::{next_accept_delay, Admit, Agent, Conn, ConnTable, TcpConn};

/// Callback binding an accepted connection to its application agent.
pub type TcpAgentFactory = Arc<dyn Fn(TcpConn) -> Box<dyn Agent> + Send + Sync>;

/// A listening TCP server with a connection cap.
pub struct TcpServer {
    addr: String,
    max_conn_num: usize,
    pending_write_num: usize,
    codec: FrameCodec,
    factory: TcpAgentFactory,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Create a server for `addr` with defaults: 100 connections, 100
    /// pending writes per connection, default framing.
    pub fn new(addr: impl Into<String>, factory: TcpAgentFactory) -> Self {
        Self {
            addr: addr.into(),
            max_conn_num: 100,
            pending_write_num: 100,
            codec: FrameCodec::default(),
            factory,
            local_addr: None,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Cap the number of simultaneously admitted connections.
    pub fn max_conn_num(mut self, n: usize) -> Self {
        self.max_conn_num = if n == 0 { 100 } else { n };
        self
    }

    /// Outbound queue length per connection.
    pub fn pending_write_num(mut self, n: usize) -> Self {
        self.pending_write_num = if n == 0 { 100 } else { n };
        self
    }

    /// Framing configuration shared by all connections.
    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.local_addr = listener.local_addr().ok();
        info!("tcp server listening on {}", self.addr);

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            rx,
            self.max_conn_num,
            self.pending_write_num,
            self.codec,
            self.factory.clone(),
        )));
        Ok(())
    }

    /// Actual bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, close every live connection, and wait for all
    /// reader tasks. After this returns no server task remains and no
    /// further `on_close` fires.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    max_conn_num: usize,
    pending_write_num: usize,
    codec: FrameCodec,
    factory: TcpAgentFactory,
) {
    let conns = ConnTable::new();
    let mut readers = JoinSet::new();
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            r = listener.accept() => match r {
                Ok((stream, _peer)) => {
                    delay = Duration::ZERO;

                    let conn = TcpConn::new(stream, pending_write_num, codec);
                    let handle = conn.ctl();
                    let id = match conns.try_insert(handle.clone(), max_conn_num) {
                        Admit::Ok(id) => id,
                        Admit::Full => {
                            handle.destroy();
                            error!(
                                "tcp too many connections, conn num={}, limit={}",
                                conns.len(),
                                max_conn_num
                            );
                            continue;
                        }
                        Admit::Closing => {
                            handle.destroy();
                            continue;
                        }
                    };

                    let mut agent = (factory)(conn);
                    let conns = conns.clone();
                    readers.spawn(async move {
                        agent.run().await;

                        handle.close();
                        conns.remove(id);
                        agent.on_close().await;
                    });
                }
                Err(e) => {
                    delay = next_accept_delay(delay);
                    error!("accept error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    conns.close_all();
    while readers.join_next().await.is_some() {}
}
