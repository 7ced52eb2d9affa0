//! Framed WebSocket connection.
//!
//! Each application message is one WebSocket binary frame; there is no
//! length prefix. `max_msg_len` is enforced on write here and on read by
//! the WebSocket library's message-size limit. Lifecycle and queueing
//! semantics are identical to the TCP variant.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{Error, Result};

use super::{AsyncStream, Conn, ConnCtl, ConnHandle};

type BoxSink = Box<dyn Sink<WsMessage, Error = WsError> + Send + Unpin>;
type BoxStream = Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send + Unpin>;

enum Outbound {
    Frame(Bytes),
    Close,
}

struct WsCore {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<Mutex<bool>>,
    kill: Arc<watch::Sender<bool>>,
    max_msg_len: u32,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl WsCore {
    fn do_destroy(&self, closed: &mut bool) {
        let _ = self.kill.send(true);
        *closed = true;
    }
}

impl ConnCtl for WsCore {
    fn write_msg(&self, parts: &[&[u8]]) -> Result<()> {
        let len: u32 = parts.iter().map(|p| p.len() as u32).sum();
        if len > self.max_msg_len {
            return Err(Error::MessageTooLong {
                len,
                max: self.max_msg_len,
            });
        }
        let mut buf = BytesMut::with_capacity(len as usize);
        for part in parts {
            buf.put_slice(part);
        }

        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            debug!("write ignored: connection closed");
            return Ok(());
        }
        match self.tx.try_send(Outbound::Frame(buf.freeze())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("destroying connection: write queue full");
                self.do_destroy(&mut closed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *closed = true;
                Ok(())
            }
        }
    }

    fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return;
        }
        if self.tx.try_send(Outbound::Close).is_err() {
            self.do_destroy(&mut closed);
            return;
        }
        *closed = true;
    }

    fn destroy(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        self.do_destroy(&mut closed);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A WebSocket connection carrying one application message per binary
/// frame.
pub struct WsConn {
    read: BoxStream,
    kill_rx: watch::Receiver<bool>,
    core: Arc<WsCore>,
}

impl WsConn {
    /// Wrap a completed WebSocket stream (server- or client-side).
    pub fn new<S>(
        ws: WebSocketStream<S>,
        pending_write_num: usize,
        max_msg_len: u32,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncStream + 'static,
    {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(pending_write_num.max(1));
        let (kill_tx, kill_rx) = watch::channel(false);
        let kill = Arc::new(kill_tx);
        let closed = Arc::new(Mutex::new(false));

        tokio::spawn(writer_task(
            Box::new(sink) as BoxSink,
            rx,
            kill.clone(),
            kill_rx.clone(),
            closed.clone(),
        ));

        Self {
            read: Box::new(stream) as BoxStream,
            kill_rx: kill_rx.clone(),
            core: Arc::new(WsCore {
                tx,
                closed,
                kill,
                max_msg_len,
                local,
                peer,
            }),
        }
    }

    async fn next_frame(read: &mut BoxStream) -> Result<Bytes> {
        loop {
            match read.next().await {
                None => return Err(Error::ConnectionClosed),
                Some(Err(e)) => return Err(Error::WebSocket(e)),
                Some(Ok(msg)) => match msg {
                    WsMessage::Binary(b) => return Ok(b),
                    WsMessage::Text(t) => return Ok(Bytes::from(t)),
                    WsMessage::Close(_) => return Err(Error::ConnectionClosed),
                    // Pings are answered by the protocol layer.
                    _ => continue,
                },
            }
        }
    }
}

#[async_trait]
impl Conn for WsConn {
    async fn read_msg(&mut self) -> Result<Bytes> {
        if *self.kill_rx.borrow() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            r = Self::next_frame(&mut self.read) => r,
            _ = self.kill_rx.changed() => Err(Error::ConnectionClosed),
        }
    }

    fn ctl(&self) -> ConnHandle {
        self.core.clone()
    }
}

async fn writer_task(
    mut sink: BoxSink,
    mut rx: mpsc::Receiver<Outbound>,
    kill: Arc<watch::Sender<bool>>,
    mut kill_rx: watch::Receiver<bool>,
    closed: Arc<Mutex<bool>>,
) {
    loop {
        tokio::select! {
            _ = kill_rx.changed() => break,
            item = rx.recv() => match item {
                None | Some(Outbound::Close) => break,
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = sink.send(WsMessage::binary(frame)).await {
                        debug!("websocket write error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Sends a close frame when the peer is still there.
    let _ = sink.close().await;
    *closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
    let _ = kill.send(true);
}
