//! UDP transport bound to a single peer

use super::{MsgConn, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

/// A UDP socket connected to one peer
pub struct UdpMsgConn {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Datagram consumed while learning the peer address
    first: Mutex<Option<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl UdpMsgConn {
    /// Bind `local` and talk to `remote`
    pub async fn connect(local: &str, remote: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let peer = socket.peer_addr()?;
        info!("UDP link {} -> {}", socket.local_addr()?, peer);
        Ok(Self::new(socket, peer, None))
    }

    /// Bind `local` and wait for the first datagram; its sender becomes the
    /// peer and the datagram is handed to the first read.
    pub async fn accept(local: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        Self::accept_on(socket).await
    }

    /// Like [`UdpMsgConn::accept`] on an already bound socket
    pub async fn accept_on(socket: UdpSocket) -> Result<Self, TransportError> {
        info!("UDP listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; u16::MAX as usize];
        let (n, peer) = socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        socket.connect(peer).await?;
        info!("UDP peer {}", peer);
        Ok(Self::new(socket, peer, Some(buf)))
    }

    fn new(socket: UdpSocket, peer: SocketAddr, first: Option<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket,
            peer,
            first: Mutex::new(first),
            closed,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn take_first(&self) -> Option<Vec<u8>> {
        self.first.lock().ok().and_then(|mut first| first.take())
    }
}

#[async_trait]
impl MsgConn for UdpMsgConn {
    async fn read_msg(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if let Some(first) = self.take_first() {
            let n = first.len().min(buf.len());
            buf[..n].copy_from_slice(&first[..n]);
            return Ok(n);
        }

        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            read = self.socket.recv(buf) => Ok(read?),
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    async fn write_msg(&self, buf: &[u8]) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        let sent = self.socket.send(buf).await?;
        if sent != buf.len() {
            debug!("short UDP send: {} of {} bytes", sent, buf.len());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }
}
