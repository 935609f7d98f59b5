use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::bus::config::BusConfig;

/// Decouples the endpoint from the datagram transport so tests can substitute
///  an in-memory or lossy implementation. Passed around as `Arc<dyn ...>`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one datagram to the channel's multicast group.
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()>;

    /// Waits for the next datagram that passed the same-host source filter.
    async fn recv(&self) -> anyhow::Result<BytesMut>;
}

/// One UDP socket joined to the fixed multicast group, bound to the channel's
///  port so unrelated bus instances do not interfere. Multicast loopback is
///  enabled (senders see their own datagrams) and the TTL is 0: the bus is a
///  same-host control plane and its traffic never leaves the machine.
pub struct MulticastTransport {
    socket: UdpSocket,
    group_addr: SocketAddrV4,
    allowed_sources: Vec<IpAddr>,
}

impl MulticastTransport {
    pub async fn bind(config: &BusConfig) -> anyhow::Result<MulticastTransport> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // several endpoints (processes) on one host share the channel port
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, config.group_port())).into())?;
        socket.join_multicast_v4(&config.multicast_group, &config.multicast_interface)?;
        socket.set_multicast_if_v4(&config.multicast_interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(0)?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!("bus transport bound to {:?} on channel {}", socket.local_addr()?, config.channel);

        Ok(MulticastTransport {
            socket,
            group_addr: SocketAddrV4::new(config.multicast_group, config.group_port()),
            allowed_sources: config.allowed_sources.clone(),
        })
    }

    fn is_same_host(&self, ip: &IpAddr) -> bool {
        ip.is_loopback() || self.allowed_sources.contains(ip)
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let num_sent = self.socket.send_to(datagram, SocketAddr::V4(self.group_addr)).await?;
        if num_sent != datagram.len() {
            bail!("datagram truncated on send: {} of {} bytes", num_sent, datagram.len());
        }
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<BytesMut> {
        let mut buf = [0u8; 1500];
        loop {
            let (num_read, from) = self.socket.recv_from(&mut buf).await?;
            if !self.is_same_host(&from.ip()) {
                warn!("dropping datagram from {:?}: not a same-host source (potential security violation)", from);
                continue;
            }
            return Ok(BytesMut::from(&buf[..num_read]));
        }
    }
}
