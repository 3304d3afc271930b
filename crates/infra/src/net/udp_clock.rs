//! Clock sync messages over UDP broadcast

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use house_audio_core::domain::clock::{ClockMessage, ClockTransport, TransportError};

const MAX_DATAGRAM: usize = 512;

struct Bound {
    socket: Arc<UdpSocket>,
    port: u16,
}

/// [`ClockTransport`] on a broadcast-enabled UDP socket
pub struct UdpClockTransport {
    bind_ip: IpAddr,
    broadcast_ip: IpAddr,
    bound: RwLock<Option<Bound>>,
}

impl UdpClockTransport {
    /// Listen on every interface and broadcast to the local segment
    pub fn new() -> Self {
        Self::with_addresses(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
        )
    }

    pub fn with_addresses(bind_ip: IpAddr, broadcast_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            broadcast_ip,
            bound: RwLock::new(None),
        }
    }

    /// Address the socket actually bound to, once bound
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let bound = self.bound.read().await;
        bound.as_ref().and_then(|b| b.socket.local_addr().ok())
    }

    async fn socket(&self) -> Result<(Arc<UdpSocket>, u16), TransportError> {
        let bound = self.bound.read().await;
        bound
            .as_ref()
            .map(|b| (b.socket.clone(), b.port))
            .ok_or(TransportError::NotBound)
    }
}

impl Default for UdpClockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn is_transient(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionReset
}

#[async_trait]
impl ClockTransport for UdpClockTransport {
    async fn bind(&self, port: u16) -> Result<(), TransportError> {
        let mut bound = self.bound.write().await;
        if bound.is_some() {
            return Ok(());
        }
        let bind_err = |source| TransportError::Bind { port, source };
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, port))
            .await
            .map_err(bind_err)?;
        socket.set_broadcast(true).map_err(bind_err)?;
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(port);
        debug!(port, "Clock socket bound");
        *bound = Some(Bound {
            socket: Arc::new(socket),
            port,
        });
        Ok(())
    }

    async fn broadcast(&self, message: &ClockMessage) -> Result<(), TransportError> {
        let (socket, port) = self.socket().await?;
        socket
            .send_to(&message.encode(), SocketAddr::new(self.broadcast_ip, port))
            .await
            .map_err(TransportError::Send)?;
        Ok(())
    }

    async fn send_to(&self, message: &ClockMessage, peer: SocketAddr) -> Result<(), TransportError> {
        let (socket, _) = self.socket().await?;
        socket
            .send_to(&message.encode(), peer)
            .await
            .map_err(TransportError::Send)?;
        Ok(())
    }

    async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(ClockMessage, SocketAddr)>, TransportError> {
        let (socket, _) = self.socket().await?;
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) if is_transient(&e) => continue,
                Ok(Err(e)) => return Err(TransportError::Recv(e)),
                Ok(Ok(received)) => received,
            };
            let (len, from) = received;
            match ClockMessage::decode(&buf[..len]) {
                Ok(message) => return Ok(Some((message, from))),
                Err(e) => trace!(%from, error = %e, "Ignoring foreign datagram"),
            }
        }
    }

    async fn close(&self) {
        if self.bound.write().await.take().is_some() {
            debug!("Clock socket closed");
        }
    }
}
