//! Network transport for RTP/RTCP
//!
//! The session drives a [`Transport`] with a data and a control channel.
//! [`UdpTransport`] is the tokio implementation; tests plug in their own.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::Result;

pub mod udp;

pub use udp::UdpTransport;

/// Datagram transport with separate data and control channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Local address of the data channel
    fn local_data_addr(&self) -> Result<SocketAddr>;

    /// Local address of the control channel
    fn local_control_addr(&self) -> Result<SocketAddr>;

    /// Send one RTP datagram, returning the bytes written
    async fn send_data(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize>;

    /// Send one RTCP datagram, returning the bytes written
    async fn send_control(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize>;

    async fn recv_data(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    async fn recv_control(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Wait up to `timeout` for a data datagram. `false` on timeout.
    async fn data_readable(&self, timeout: Duration) -> Result<bool>;

    /// Wait up to `timeout` for a control datagram. `false` on timeout.
    async fn control_readable(&self, timeout: Duration) -> Result<bool>;
}

/// A remote participant's transport addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub addr: IpAddr,
    pub data_port: u16,
    pub control_port: u16,
}

impl Destination {
    /// Without an explicit control port RTCP goes to `data_port + 1`
    pub fn new(addr: IpAddr, data_port: u16, control_port: Option<u16>) -> Self {
        Self {
            addr,
            data_port,
            control_port: control_port.unwrap_or_else(|| data_port.wrapping_add(1)),
        }
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.data_port)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.control_port)
    }
}

/// Ordered set of destinations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationList {
    destinations: Vec<Destination>,
}

impl DestinationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination. Returns `false` if it is already listed.
    pub fn add(&mut self, destination: Destination) -> bool {
        if self.destinations.contains(&destination) {
            return false;
        }
        self.destinations.push(destination);
        true
    }

    /// Remove an exact match. Returns `false` if it was not listed.
    pub fn forget(&mut self, destination: &Destination) -> bool {
        let before = self.destinations.len();
        self.destinations.retain(|d| d != destination);
        self.destinations.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter()
    }

    pub fn data_addrs(&self) -> Vec<SocketAddr> {
        self.destinations.iter().map(Destination::data_addr).collect()
    }

    pub fn control_addrs(&self) -> Vec<SocketAddr> {
        self.destinations.iter().map(Destination::control_addr).collect()
    }

    pub fn is_single(&self) -> bool {
        self.destinations.len() == 1
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// Send one datagram to each address on the data or control channel.
/// Returns the total number of bytes written.
pub async fn send_to_all(transport: &dyn Transport, bytes: &[u8], dests: &[SocketAddr], control: bool) -> Result<usize> {
    let mut written = 0;
    if let [single] = dests {
        written += if control {
            transport.send_control(bytes, *single).await?
        } else {
            transport.send_data(bytes, *single).await?
        };
        return Ok(written);
    }
    for dest in dests {
        written += if control {
            transport.send_control(bytes, *dest).await?
        } else {
            transport.send_data(bytes, *dest).await?
        };
    }
    trace!("Sent {} bytes to {} destinations", bytes.len(), dests.len());
    Ok(written)
}
