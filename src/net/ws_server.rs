//! WebSocket accept supervisor.
//!
//! Accepted sockets are upgraded under the HTTP handshake timeout, with
//! optional TLS termination first. The client IP is taken from
//! `X-Forwarded-For` / `X-Real-IP` (first comma-separated token) with the
//! socket peer address as the fallback. Admission and lifecycle follow the
//! TCP server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

use super::{next_accept_delay, Admit, Agent, AsyncStream, Conn, ConnTable, WsConn};

/// Callback binding an upgraded connection to its application agent.
pub type WsAgentFactory = Arc<dyn Fn(WsConn) -> Box<dyn Agent> + Send + Sync>;

/// A listening WebSocket server.
pub struct WsServer {
    addr: String,
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    factory: WsAgentFactory,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl WsServer {
    /// Create a server for `addr` with defaults: 100 connections, 100
    /// pending writes, 4096-byte messages, 10 s handshake timeout, no TLS.
    pub fn new(addr: impl Into<String>, factory: WsAgentFactory) -> Self {
        Self {
            addr: addr.into(),
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            http_timeout: Duration::from_secs(10),
            cert_file: None,
            key_file: None,
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

    /// Maximum message length, enforced on both read and write.
    pub fn max_msg_len(mut self, n: u32) -> Self {
        self.max_msg_len = if n == 0 { 4096 } else { n };
        self
    }

    /// HTTP handshake timeout.
    pub fn http_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.http_timeout = d;
        }
        self
    }

    /// Serve TLS with the given PEM certificate chain and private key.
    pub fn tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.local_addr = listener.local_addr().ok();

        let tls = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
            _ => None,
        };
        info!(
            "ws server listening on {}{}",
            self.addr,
            if tls.is_some() { " (tls)" } else { "" }
        );

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            rx,
            tls,
            SessionConfig {
                max_conn_num: self.max_conn_num,
                pending_write_num: self.pending_write_num,
                max_msg_len: self.max_msg_len,
                http_timeout: self.http_timeout,
            },
            self.factory.clone(),
        )));
        Ok(())
    }

    /// Actual bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, close every live connection, and wait for all
    /// session tasks.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

#[derive(Clone, Copy)]
struct SessionConfig {
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
}

fn load_tls(cert_file: &std::path::Path, key_file: &std::path::Path) -> Result<TlsAcceptor> {
    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_file)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;

    let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_file)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", key_file.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// First token of `X-Forwarded-For` / `X-Real-IP`, if parseable.
fn forwarded_ip(req: &Request) -> Option<IpAddr> {
    let headers = req.headers();
    let raw = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))?
        .to_str()
        .ok()?;
    raw.split(',').next()?.trim().parse().ok()
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    tls: Option<TlsAcceptor>,
    cfg: SessionConfig,
    factory: WsAgentFactory,
) {
    let conns = ConnTable::new();
    let mut sessions = JoinSet::new();
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            r = listener.accept() => match r {
                Ok((stream, peer)) => {
                    delay = Duration::ZERO;
                    sessions.spawn(session(
                        stream,
                        peer,
                        tls.clone(),
                        cfg,
                        conns.clone(),
                        factory.clone(),
                    ));
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
    while sessions.join_next().await.is_some() {}
}

async fn session(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    cfg: SessionConfig,
    conns: Arc<ConnTable>,
    factory: WsAgentFactory,
) {
    let local = stream.local_addr().ok();

    let stream: Box<dyn AsyncStream> = match &tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(s) => Box::new(s),
            Err(e) => {
                debug!("tls handshake from {peer} failed: {e}");
                return;
            }
        },
        None => Box::new(stream),
    };

    let ws_config =
        WebSocketConfig::default().max_message_size(Some(cfg.max_msg_len as usize));
    let mut origin: Option<IpAddr> = None;
    let callback = |req: &Request, resp: Response| {
        origin = forwarded_ip(req);
        Ok(resp)
    };

    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
    let ws = match tokio::time::timeout(cfg.http_timeout, upgrade).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("websocket upgrade from {peer} failed: {e}");
            return;
        }
        Err(_) => {
            debug!("websocket handshake from {peer} timed out");
            return;
        }
    };

    let remote = origin.map(|ip| SocketAddr::new(ip, 0)).unwrap_or(peer);
    let conn = WsConn::new(ws, cfg.pending_write_num, cfg.max_msg_len, local, Some(remote));
    let handle = conn.ctl();
    let id = match conns.try_insert(handle.clone(), cfg.max_conn_num) {
        Admit::Ok(id) => id,
        Admit::Full => {
            handle.destroy();
            error!(
                "ws too many connections, conn num={}, limit={}",
                conns.len(),
                cfg.max_conn_num
            );
            return;
        }
        Admit::Closing => {
            handle.destroy();
            return;
        }
    };

    let mut agent = (factory)(conn);
    agent.run().await;

    handle.close();
    conns.remove(id);
    agent.on_close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct EchoAgent {
        conn: Option<WsConn>,
        closes: Arc<AtomicUsize>,
        seen_remote: Arc<std::sync::Mutex<Option<SocketAddr>>>,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        async fn run(&mut self) {
            let conn = self.conn.as_mut().expect("agent runs once");
            *self.seen_remote.lock().unwrap() = conn.ctl().remote_addr();
            loop {
                match conn.read_msg().await {
                    Ok(data) => {
                        if conn.ctl().write_msg(&[&data]).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        async fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        closes: Arc<AtomicUsize>,
        remote: Arc<std::sync::Mutex<Option<SocketAddr>>>,
        factory: WsAgentFactory,
    }

    fn fixture() -> Fixture {
        let closes = Arc::new(AtomicUsize::new(0));
        let remote = Arc::new(std::sync::Mutex::new(None));
        let closes2 = closes.clone();
        let remote2 = remote.clone();
        let factory: WsAgentFactory = Arc::new(move |conn| {
            Box::new(EchoAgent {
                conn: Some(conn),
                closes: closes2.clone(),
                seen_remote: remote2.clone(),
            })
        });
        Fixture {
            closes,
            remote,
            factory,
        }
    }

    #[tokio::test]
    async fn test_ws_echo_end_to_end() {
        let fx = fixture();
        let mut server = WsServer::new("127.0.0.1:0", fx.factory.clone());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let (mut client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        client
            .send(WsMessage::binary(Bytes::from_static(b"marco")))
            .await
            .unwrap();
        let back = client.next().await.unwrap().unwrap();
        assert_eq!(back.into_data(), Bytes::from_static(b"marco"));

        client.close(None).await.unwrap();
        server.close().await;
        assert_eq!(fx.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ws_remote_addr_is_socket_peer_without_proxy_headers() {
        let fx = fixture();
        let mut server = WsServer::new("127.0.0.1:0", fx.factory.clone());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let (mut client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        client
            .send(WsMessage::binary(Bytes::from_static(b"x")))
            .await
            .unwrap();
        client.next().await;

        let remote = fx.remote.lock().unwrap().expect("agent saw a remote");
        assert_eq!(remote.ip(), addr.ip());

        client.close(None).await.unwrap();
        server.close().await;
    }

    #[tokio::test]
    async fn test_forwarded_ip_parses_first_token() {
        let req = Request::builder()
            .uri("ws://example/")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(forwarded_ip(&req), Some("203.0.113.9".parse().unwrap()));

        let req = Request::builder()
            .uri("ws://example/")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(forwarded_ip(&req), Some("198.51.100.2".parse().unwrap()));

        let req = Request::builder().uri("ws://example/").body(()).unwrap();
        assert_eq!(forwarded_ip(&req), None);
    }

    #[tokio::test]
    async fn test_ws_admission_cap() {
        let fx = fixture();
        let mut server = WsServer::new("127.0.0.1:0", fx.factory.clone()).max_conn_num(1);
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let (mut first, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        first
            .send(WsMessage::binary(Bytes::from_static(b"one")))
            .await
            .unwrap();
        first.next().await.unwrap().unwrap();

        // Second connection completes the handshake but is dropped before
        // any echo happens.
        let (mut second, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let _ = second
            .send(WsMessage::binary(Bytes::from_static(b"two")))
            .await;
        let got_echo = matches!(
            tokio::time::timeout(Duration::from_millis(500), second.next()).await,
            Ok(Some(Ok(WsMessage::Binary(_))))
        );
        assert!(!got_echo);

        // First connection remains undisturbed.
        first
            .send(WsMessage::binary(Bytes::from_static(b"still")))
            .await
            .unwrap();
        let back = first.next().await.unwrap().unwrap();
        assert_eq!(back.into_data(), Bytes::from_static(b"still"));

        let _ = first.close(None).await;
        server.close().await;
    }
}
