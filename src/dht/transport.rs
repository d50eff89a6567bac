//! Datagram transport used by the DHT node

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::error::TorrentError;

/// Largest datagram the node reads
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Plain UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", addr, e);
            TorrentError::network_error_full("Failed to bind UDP socket", addr.to_string(), e.to_string())
        })?;
        info!("DHT listening on {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(data, addr).await.map_err(|e| {
            TorrentError::network_error_full("Failed to send datagram", addr.to_string(), e.to_string())
        })?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
