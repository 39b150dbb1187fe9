//! UDP transport for RTP/RTCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::error::Error;
use crate::Result;
use super::Transport;

/// A pair of UDP sockets, one for RTP and one for RTCP
#[derive(Debug, Clone)]
pub struct UdpTransport {
    data_socket: Arc<UdpSocket>,
    control_socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the data socket to `data_addr` and the control socket to
    /// `control_addr`, or to the next port when none is given.
    pub async fn bind(data_addr: SocketAddr, control_addr: Option<SocketAddr>) -> Result<Self> {
        let data_socket = UdpSocket::bind(data_addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind RTP socket {}: {}", data_addr, e)))?;

        let control_addr = match control_addr {
            Some(addr) => addr,
            None => {
                let bound = data_socket.local_addr()?;
                let port = if data_addr.port() == 0 { 0 } else { bound.port().wrapping_add(1) };
                SocketAddr::new(bound.ip(), port)
            }
        };
        let control_socket = UdpSocket::bind(control_addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind RTCP socket {}: {}", control_addr, e)))?;

        info!(
            "UDP transport bound: RTP {:?}, RTCP {:?}",
            data_socket.local_addr().ok(),
            control_socket.local_addr().ok()
        );

        Ok(Self {
            data_socket: Arc::new(data_socket),
            control_socket: Arc::new(control_socket),
        })
    }

    async fn readable(socket: &UdpSocket, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, socket.readable()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(Error::Transport(format!("Socket error while waiting: {}", e))),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_data_addr(&self) -> Result<SocketAddr> {
        self.data_socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local RTP address: {}", e)))
    }

    fn local_control_addr(&self) -> Result<SocketAddr> {
        self.control_socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local RTCP address: {}", e)))
    }

    async fn send_data(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize> {
        let sent = self
            .data_socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| Error::Transport(format!("Failed to send RTP packet to {}: {}", dest, e)))?;
        trace!("Sent {} RTP bytes to {}", sent, dest);
        Ok(sent)
    }

    async fn send_control(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize> {
        let sent = self
            .control_socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| Error::Transport(format!("Failed to send RTCP packet to {}: {}", dest, e)))?;
        trace!("Sent {} RTCP bytes to {}", sent, dest);
        Ok(sent)
    }

    async fn recv_data(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.data_socket
            .recv_from(buffer)
            .await
            .map_err(|e| Error::Transport(format!("Failed to receive RTP packet: {}", e)))
    }

    async fn recv_control(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.control_socket
            .recv_from(buffer)
            .await
            .map_err(|e| Error::Transport(format!("Failed to receive RTCP packet: {}", e)))
    }

    async fn data_readable(&self, timeout: Duration) -> Result<bool> {
        Self::readable(&self.data_socket, timeout).await
    }

    async fn control_readable(&self, timeout: Duration) -> Result<bool> {
        Self::readable(&self.control_socket, timeout).await
    }
}
