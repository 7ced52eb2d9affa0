//! Framed TCP connection.
//!
//! ```text
//! reader task ── read_msg ──► FrameCodec::read ──► socket
//! any task ───── write_msg ─► bounded queue ─► writer task ─► socket
//! ```
//!
//! The writer task exits on the close sentinel, a kill signal, or a write
//! error; it then shuts the stream down, marks the connection closed, and
//! kills the reader. Messages enqueued from one task reach the peer in
//! enqueue order.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::{Error, Result};

use super::{AsyncStream, Conn, ConnCtl, ConnHandle};

pub(crate) enum Outbound {
    Frame(Bytes),
    /// Close sentinel: the writer drains everything queued before it, then
    /// exits.
    Close,
}

pub(crate) struct ConnCore {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<Mutex<bool>>,
    kill: Arc<watch::Sender<bool>>,
    codec: FrameCodec,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

fn set_flag(flag: &Mutex<bool>) {
    *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
}

impl ConnCore {
    fn do_destroy(&self, closed: &mut bool) {
        let _ = self.kill.send(true);
        *closed = true;
    }
}

impl ConnCtl for ConnCore {
    fn write_msg(&self, parts: &[&[u8]]) -> Result<()> {
        let frame = self.codec.encode(parts)?;

        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            debug!("write ignored: connection closed");
            return Ok(());
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The application outran its own send queue; dropping the
                // message would corrupt the stream, so kill the connection.
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
            // Queue full or writer already gone: fall back to destroy.
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

/// A length-prefixed TCP connection.
///
/// The value owns the read side and is held by the reader task; writes and
/// lifecycle control go through the cloneable [`ConnHandle`] from
/// [`Conn::ctl`].
pub struct TcpConn {
    read: ReadHalf<Box<dyn AsyncStream>>,
    kill_rx: watch::Receiver<bool>,
    core: Arc<ConnCore>,
}

impl TcpConn {
    /// Wrap an accepted or dialed TCP stream.
    pub fn new(stream: TcpStream, pending_write_num: usize, codec: FrameCodec) -> Self {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        Self::from_stream(Box::new(stream), pending_write_num, codec, local, peer)
    }

    /// Wrap any byte stream. Used directly by tests and by transports that
    /// layer TCP framing over other streams.
    pub fn from_stream(
        stream: Box<dyn AsyncStream>,
        pending_write_num: usize,
        codec: FrameCodec,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(pending_write_num.max(1));
        let (kill_tx, kill_rx) = watch::channel(false);
        let kill = Arc::new(kill_tx);
        let closed = Arc::new(Mutex::new(false));

        tokio::spawn(writer_task(
            write,
            rx,
            kill.clone(),
            kill_rx.clone(),
            closed.clone(),
        ));

        Self {
            read,
            kill_rx: kill_rx.clone(),
            core: Arc::new(ConnCore {
                tx,
                closed,
                kill,
                codec,
                local,
                peer,
            }),
        }
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_msg(&mut self) -> Result<Bytes> {
        if *self.kill_rx.borrow() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            r = self.core.codec.read(&mut self.read) => r,
            _ = self.kill_rx.changed() => Err(Error::ConnectionClosed),
        }
    }

    fn ctl(&self) -> ConnHandle {
        self.core.clone()
    }
}

async fn writer_task(
    mut write: WriteHalf<Box<dyn AsyncStream>>,
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
                    if let Err(e) = write.write_all(&frame).await {
                        debug!("connection write error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = write.shutdown().await;
    set_flag(&closed);
    // The reader exits too; exactly one writer per connection, gone now.
    let _ = kill.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn pair(pending: usize) -> (TcpConn, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let conn = TcpConn::from_stream(
            Box::new(ours),
            pending,
            FrameCodec::default(),
            None,
            None,
        );
        (conn, theirs)
    }

    #[tokio::test]
    async fn test_write_msg_reaches_peer_framed() {
        let (conn, mut peer) = pair(16);
        conn.ctl().write_msg(&[b"hello"]).unwrap();

        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn test_writer_ordering_single_producer() {
        let (conn, mut peer) = pair(64);
        let ctl = conn.ctl();
        for i in 0..20u8 {
            ctl.write_msg(&[&[i]]).unwrap();
        }

        for i in 0..20u8 {
            let mut buf = [0u8; 3];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x00, 0x01, i]);
        }
    }

    #[tokio::test]
    async fn test_read_msg_roundtrip() {
        let (mut conn, mut peer) = pair(16);
        tokio::io::AsyncWriteExt::write_all(&mut peer, &[0x00, 0x02, 0xAB, 0xCD])
            .await
            .unwrap();

        let msg = conn.read_msg().await.unwrap();
        assert_eq!(&msg[..], &[0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_nothing_sent() {
        let (conn, mut peer) = pair(16);
        let ctl = conn.ctl();
        let big = vec![0u8; 5000];
        let err = ctl.write_msg(&[&big]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { .. }));
        assert!(!ctl.is_closed());

        // Nothing reached the wire.
        let mut buf = [0u8; 1];
        let r = timeout(Duration::from_millis(50), peer.read_exact(&mut buf)).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_silently_ignored() {
        let (conn, _peer) = pair(16);
        let ctl = conn.ctl();
        ctl.close();
        assert!(ctl.is_closed());
        assert!(ctl.write_msg(&[b"late"]).is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _peer) = pair(16);
        let ctl = conn.ctl();
        ctl.close();
        ctl.close();
        ctl.destroy();
        assert!(ctl.is_closed());
    }

    #[tokio::test]
    async fn test_queue_full_destroys_connection() {
        // Tiny peer buffer: the writer blocks on the first frame, the queue
        // (capacity 2) fills, and the next write destroys the connection.
        let (ours, peer) = tokio::io::duplex(1);
        let mut conn = TcpConn::from_stream(
            Box::new(ours),
            2,
            FrameCodec::default(),
            None,
            None,
        );
        let ctl = conn.ctl();

        let payload = vec![0xEE; 512];
        for _ in 0..5 {
            ctl.write_msg(&[&payload]).unwrap();
            tokio::task::yield_now().await;
        }
        assert!(ctl.is_closed());

        // The reader observes the teardown within a bounded delay.
        let r = timeout(Duration::from_secs(1), conn.read_msg()).await;
        assert!(matches!(r, Ok(Err(_))));
        drop(peer);
    }

    #[tokio::test]
    async fn test_destroy_unblocks_reader() {
        let (mut conn, _peer) = pair(16);
        let ctl = conn.ctl();

        let reader = tokio::spawn(async move { conn.read_msg().await });
        tokio::task::yield_now().await;
        ctl.destroy();

        let r = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(r, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_queue() {
        let (conn, mut peer) = pair(16);
        let ctl = conn.ctl();
        ctl.write_msg(&[b"bye"]).unwrap();
        ctl.close();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0x00, 0x03, b'b', b'y', b'e']);

        // Peer then observes EOF from the writer's shutdown.
        let mut end = [0u8; 1];
        let n = peer.read(&mut end).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_peer_eof_errors_reader() {
        let (mut conn, peer) = pair(16);
        drop(peer);
        let r = conn.read_msg().await;
        assert!(r.is_err());
    }
}
