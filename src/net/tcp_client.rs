//! TCP dial supervisor.
//!
//! One task per configured connection slot:
//!
//! ```text
//! Disconnected ─► Dialing ─► Connected ─► (Disconnected if auto_reconnect
//!                                          else Stopped)
//! ```
//!
//! Dialing retries every `connect_interval` until success or shutdown.
//! `close()` flags shutdown, closes every open connection, and waits for
//! all slot tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec::FrameCodec;

use super::{Admit, Agent, Conn, ConnTable, TcpConn};
use super::tcp_server::TcpAgentFactory;

/// A reconnecting TCP client with N parallel dial slots.
pub struct TcpClient {
    addr: String,
    conn_num: usize,
    connect_interval: Duration,
    pending_write_num: usize,
    auto_reconnect: bool,
    codec: FrameCodec,
    factory: TcpAgentFactory,
    conns: Arc<ConnTable>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpClient {
    /// Create a client for `addr` with defaults: one connection slot, 3 s
    /// reconnect interval, 100 pending writes, auto-reconnect off.
    pub fn new(addr: impl Into<String>, factory: TcpAgentFactory) -> Self {
        Self {
            addr: addr.into(),
            conn_num: 1,
            connect_interval: Duration::from_secs(3),
            pending_write_num: 100,
            auto_reconnect: false,
            codec: FrameCodec::default(),
            factory,
            conns: ConnTable::new(),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Number of parallel dial slots.
    pub fn conn_num(mut self, n: usize) -> Self {
        self.conn_num = n.max(1);
        self
    }

    /// Delay between dial attempts and before reconnects.
    pub fn connect_interval(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.connect_interval = d;
        }
        self
    }

    /// Outbound queue length per connection.
    pub fn pending_write_num(mut self, n: usize) -> Self {
        self.pending_write_num = if n == 0 { 100 } else { n };
        self
    }

    /// Redial after a connection ends instead of stopping the slot.
    pub fn auto_reconnect(mut self, yes: bool) -> Self {
        self.auto_reconnect = yes;
        self
    }

    /// Framing configuration shared by all connections.
    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Spawn the dial slots.
    pub fn start(&mut self) {
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        for _ in 0..self.conn_num {
            self.tasks.push(tokio::spawn(slot_loop(
                self.addr.clone(),
                self.connect_interval,
                self.pending_write_num,
                self.auto_reconnect,
                self.codec,
                self.factory.clone(),
                self.conns.clone(),
                rx.clone(),
            )));
        }
    }

    /// Flag shutdown, close every open connection, and wait for all slot
    /// tasks to finish.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        self.conns.close_all();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn slot_loop(
    addr: String,
    connect_interval: Duration,
    pending_write_num: usize,
    auto_reconnect: bool,
    codec: FrameCodec,
    factory: TcpAgentFactory,
    conns: Arc<ConnTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Dialing: retry until success or shutdown.
        let stream = loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                r = TcpStream::connect(&addr) => match r {
                    Ok(s) => break s,
                    Err(e) => {
                        info!("connect to {addr} failed: {e}; retrying in {connect_interval:?}");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(connect_interval) => {}
                        }
                    }
                }
            }
        };

        // Connected: run the agent to completion.
        let conn = TcpConn::new(stream, pending_write_num, codec);
        let handle = conn.ctl();
        let id = match conns.try_insert(handle.clone(), usize::MAX) {
            Admit::Ok(id) => id,
            Admit::Full | Admit::Closing => {
                handle.destroy();
                return;
            }
        };

        let mut agent = (factory)(conn);
        agent.run().await;

        handle.close();
        conns.remove(id);
        agent.on_close().await;

        if !auto_reconnect {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(connect_interval) => {}
        }
    }
}
