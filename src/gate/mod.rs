//! Gate module.
//!
//! The gate owns the player-facing servers. Per configuration it starts a
//! WebSocket and/or a TCP server sharing one processor; every accepted
//! connection gets an [`Agent`] - the application-facing handle - and a
//! reader loop that unmarshals and routes each message with the agent as
//! user data.
//!
//! When an agent-notification server is configured, the gate fires
//! `new_agent` on creation (fire-and-forget) and `close_agent` (synchronous)
//! after the reader loop exits.

use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::chanrpc::{CallId, ServerHandle};
use crate::codec::{ByteOrder, FrameCodec, LenWidth, Processor};
use crate::module::Module;
use crate::net::{
    Agent as NetAgent, Conn, ConnHandle, TcpAgentFactory, TcpServer, WsAgentFactory, WsServer,
};

/// Chanrpc id notified (fire-and-forget) when an agent is created.
pub const NEW_AGENT: CallId = "new_agent";

/// Chanrpc id called (synchronously) after an agent's connection closed.
pub const CLOSE_AGENT: CallId = "close_agent";

struct AgentInner {
    conn: ConnHandle,
    processor: Option<Arc<dyn Processor>>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// The application-facing handle for one connection.
///
/// Cheap to clone; routed to handlers as the user-data argument of every
/// message from its connection. Readable and writable from any task: reads
/// happen only on the connection's reader loop, writes enqueue onto the
/// connection's outbound queue.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    fn new(conn: ConnHandle, processor: Option<Arc<dyn Processor>>) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                conn,
                processor,
                user_data: Mutex::new(None),
            }),
        }
    }

    /// Marshal `msg` through the gate's processor and enqueue it. Failures
    /// are logged; the connection-level queue-full policy applies.
    pub fn write_msg(&self, msg: &dyn Any) {
        let Some(processor) = &self.inner.processor else {
            return;
        };
        let parts = match processor.marshal(msg) {
            Ok(parts) => parts,
            Err(e) => {
                error!("marshal message error: {e}");
                return;
            }
        };
        let slices: Vec<&[u8]> = parts.iter().map(|p| &p[..]).collect();
        if let Err(e) = self.inner.conn.write_msg(&slices) {
            error!("write message error: {e}");
        }
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.conn.local_addr()
    }

    /// Peer address of the connection.
    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.conn.remote_addr()
    }

    /// Gracefully close the connection.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    /// Forcefully terminate the connection.
    pub fn destroy(&self) {
        self.inner.conn.destroy();
    }

    /// The opaque user-data slot. Never interpreted by the framework.
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner
            .user_data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the user-data slot.
    pub fn set_user_data(&self, data: Option<Arc<dyn Any + Send + Sync>>) {
        *self
            .inner
            .user_data
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = data;
    }
}

/// Reader loop binding a connection to its agent.
struct AgentRunner {
    conn: Box<dyn Conn>,
    agent: Agent,
    processor: Option<Arc<dyn Processor>>,
    rpc: Option<ServerHandle>,
}

#[async_trait]
impl NetAgent for AgentRunner {
    async fn run(&mut self) {
        loop {
            let data = match self.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("read message: {e}");
                    break;
                }
            };
            let Some(processor) = &self.processor else {
                continue;
            };
            let msg = match processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("unmarshal message error: {e}");
                    break;
                }
            };
            if let Err(e) = processor.route(msg, Box::new(self.agent.clone())) {
                debug!("route message error: {e}");
                break;
            }
        }
    }

    async fn on_close(&mut self) {
        if let Some(rpc) = &self.rpc {
            if let Err(e) = rpc
                .call0(CLOSE_AGENT, vec![Box::new(self.agent.clone())])
                .await
            {
                error!("chanrpc error: {e}");
            }
        }
    }
}

fn make_agent(
    conn: Box<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    rpc: Option<ServerHandle>,
) -> Box<dyn NetAgent> {
    let agent = Agent::new(conn.ctl(), processor.clone());
    if let Some(rpc) = &rpc {
        if let Err(e) = rpc.go(NEW_AGENT, vec![Box::new(agent.clone())]) {
            warn!("new_agent notification dropped: {e}");
        }
    }
    Box::new(AgentRunner {
        conn,
        agent,
        processor,
        rpc,
    })
}

/// Agent factory for TCP servers and clients using processor routing.
pub fn tcp_factory(
    processor: Option<Arc<dyn Processor>>,
    rpc: Option<ServerHandle>,
) -> TcpAgentFactory {
    Arc::new(move |conn| make_agent(Box::new(conn), processor.clone(), rpc.clone()))
}

/// Agent factory for WebSocket servers and clients using processor
/// routing.
pub fn ws_factory(
    processor: Option<Arc<dyn Processor>>,
    rpc: Option<ServerHandle>,
) -> WsAgentFactory {
    Arc::new(move |conn| make_agent(Box::new(conn), processor.clone(), rpc.clone()))
}

/// The gateway module: player-facing WS and/or TCP servers.
///
/// Plain configuration struct; fill in the fields and register it as a
/// module.
pub struct Gate {
    /// Connection cap shared by each started server.
    pub max_conn_num: usize,
    /// Outbound queue length per connection.
    pub pending_write_num: usize,
    /// Maximum message length for both transports.
    pub max_msg_len: u32,
    /// Message processor; connections without one drain and discard.
    pub processor: Option<Arc<dyn Processor>>,
    /// Receiver of `new_agent` / `close_agent` notifications.
    pub agent_rpc: Option<ServerHandle>,

    /// WebSocket listen address; `None` disables the WS server.
    pub ws_addr: Option<String>,
    /// HTTP handshake timeout for the WS server.
    pub http_timeout: Duration,
    /// TLS certificate chain (PEM) for the WS server.
    pub cert_file: Option<PathBuf>,
    /// TLS private key (PEM) for the WS server.
    pub key_file: Option<PathBuf>,

    /// TCP listen address; `None` disables the TCP server.
    pub tcp_addr: Option<String>,
    /// Width of the TCP length prefix.
    pub len_width: LenWidth,
    /// Byte order of the TCP length prefix.
    pub byte_order: ByteOrder,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            processor: None,
            agent_rpc: None,
            ws_addr: None,
            http_timeout: Duration::from_secs(10),
            cert_file: None,
            key_file: None,
            tcp_addr: None,
            len_width: LenWidth::U16,
            byte_order: ByteOrder::Big,
        }
    }
}

#[async_trait]
impl Module for Gate {
    async fn run(&mut self, shutdown: oneshot::Receiver<()>) {
        let mut ws_server = match &self.ws_addr {
            Some(addr) => {
                let mut server = WsServer::new(
                    addr.clone(),
                    ws_factory(self.processor.clone(), self.agent_rpc.clone()),
                )
                .max_conn_num(self.max_conn_num)
                .pending_write_num(self.pending_write_num)
                .max_msg_len(self.max_msg_len)
                .http_timeout(self.http_timeout);
                if let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) {
                    server = server.tls(cert, key);
                }
                match server.start().await {
                    Ok(()) => {
                        info!("gate ws service startup: {addr}");
                        Some(server)
                    }
                    Err(e) => {
                        error!("gate ws service failed to start on {addr}: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let mut tcp_server = match &self.tcp_addr {
            Some(addr) => {
                let codec =
                    FrameCodec::new(self.len_width, 1, self.max_msg_len, self.byte_order);
                let mut server = TcpServer::new(
                    addr.clone(),
                    tcp_factory(self.processor.clone(), self.agent_rpc.clone()),
                )
                .max_conn_num(self.max_conn_num)
                .pending_write_num(self.pending_write_num)
                .codec(codec);
                match server.start().await {
                    Ok(()) => {
                        info!("gate tcp service startup: {addr}");
                        Some(server)
                    }
                    Err(e) => {
                        error!("gate tcp service failed to start on {addr}: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let _ = shutdown.await;

        if let Some(server) = &mut ws_server {
            server.close().await;
            info!("gate ws service stopped");
        }
        if let Some(server) = &mut tcp_server {
            server.close().await;
            info!("gate tcp service stopped");
        }
    }
}
