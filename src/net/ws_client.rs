//! WebSocket dial supervisor.
//!
//! Mirrors [`TcpClient`](super::TcpClient): N dial slots, retry every
//! `connect_interval`, optional auto-reconnect. The handshake runs under
//! its own timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::MaybeTlsStream;
use tracing::info;

use super::ws_server::WsAgentFactory;
use super::{Admit, Agent, Conn, ConnTable, WsConn};

/// A reconnecting WebSocket client with N parallel dial slots.
pub struct WsClient {
    url: String,
    conn_num: usize,
    connect_interval: Duration,
    pending_write_num: usize,
    max_msg_len: u32,
    handshake_timeout: Duration,
    auto_reconnect: bool,
    factory: WsAgentFactory,
    conns: Arc<ConnTable>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsClient {
    /// Create a client for `url` (`ws://` or `wss://`) with defaults: one
    /// slot, 3 s reconnect interval, 100 pending writes, 4096-byte
    /// messages, 10 s handshake timeout, auto-reconnect off.
    pub fn new(url: impl Into<String>, factory: WsAgentFactory) -> Self {
        Self {
            url: url.into(),
            conn_num: 1,
            connect_interval: Duration::from_secs(3),
            pending_write_num: 100,
            max_msg_len: 4096,
            handshake_timeout: Duration::from_secs(10),
            auto_reconnect: false,
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

    /// Maximum message length, enforced on both read and write.
    pub fn max_msg_len(mut self, n: u32) -> Self {
        self.max_msg_len = if n == 0 { 4096 } else { n };
        self
    }

    /// WebSocket handshake timeout.
    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.handshake_timeout = d;
        }
        self
    }

    /// Redial after a connection ends instead of stopping the slot.
    pub fn auto_reconnect(mut self, yes: bool) -> Self {
        self.auto_reconnect = yes;
        self
    }

    /// Spawn the dial slots.
    pub fn start(&mut self) {
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        for _ in 0..self.conn_num {
            self.tasks.push(tokio::spawn(slot_loop(
                self.url.clone(),
                self.connect_interval,
                self.pending_write_num,
                self.max_msg_len,
                self.handshake_timeout,
                self.auto_reconnect,
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
    url: String,
    connect_interval: Duration,
    pending_write_num: usize,
    max_msg_len: u32,
    handshake_timeout: Duration,
    auto_reconnect: bool,
    factory: WsAgentFactory,
    conns: Arc<ConnTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_config = WebSocketConfig::default().max_message_size(Some(max_msg_len as usize));

    loop {
        // Dialing: retry until the handshake completes or shutdown.
        let ws = loop {
            if *shutdown.borrow() {
                return;
            }
            let dial = tokio::time::timeout(
                handshake_timeout,
                connect_async_with_config(url.as_str(), Some(ws_config), false),
            );
            tokio::select! {
                _ = shutdown.changed() => return,
                r = dial => match r {
                    Ok(Ok((ws, _resp))) => break ws,
                    Ok(Err(e)) => {
                        info!("connect to {url} failed: {e}; retrying in {connect_interval:?}");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(connect_interval) => {}
                        }
                    }
                    Err(_) => {
                        info!("handshake with {url} timed out; retrying in {connect_interval:?}");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(connect_interval) => {}
                        }
                    }
                }
            }
        };

        let peer = match ws.get_ref() {
            MaybeTlsStream::Plain(s) => s.peer_addr().ok(),
            _ => None,
        };
        let local: Option<SocketAddr> = match ws.get_ref() {
            MaybeTlsStream::Plain(s) => s.local_addr().ok(),
            _ => None,
        };

        let conn = WsConn::new(ws, pending_write_num, max_msg_len, local, peer);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::WsServer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PingAgent {
        conn: Option<WsConn>,
        echoes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for PingAgent {
        async fn run(&mut self) {
            let conn = self.conn.as_mut().expect("agent runs once");
            conn.ctl().write_msg(&[b"ping"]).expect("write");
            if let Ok(data) = conn.read_msg().await {
                if &data[..] == b"ping" {
                    self.echoes.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        async fn on_close(&mut self) {}
    }

    struct EchoAgent {
        conn: Option<WsConn>,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        async fn run(&mut self) {
            let conn = self.conn.as_mut().expect("agent runs once");
            while let Ok(data) = conn.read_msg().await {
                if conn.ctl().write_msg(&[&data]).is_err() {
                    break;
                }
            }
        }

        async fn on_close(&mut self) {}
    }

    #[tokio::test]
    async fn test_ws_client_against_ws_server() {
        let server_factory: WsAgentFactory =
            Arc::new(|conn| Box::new(EchoAgent { conn: Some(conn) }));
        let mut server = WsServer::new("127.0.0.1:0", server_factory);
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let echoes = Arc::new(AtomicUsize::new(0));
        let echoes2 = echoes.clone();
        let client_factory: WsAgentFactory = Arc::new(move |conn| {
            Box::new(PingAgent {
                conn: Some(conn),
                echoes: echoes2.clone(),
            })
        });
        let mut client = WsClient::new(format!("ws://{addr}/"), client_factory);
        client.start();

        for _ in 0..200 {
            if echoes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(echoes.load(Ordering::SeqCst), 1);

        client.close().await;
        server.close().await;
    }
}
