use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration of one bus endpoint. [BusConfig::new] supplies the
///  production defaults; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// fixed multicast group shared by all bus instances on a host
    pub multicast_group: Ipv4Addr,
    /// the group port is `base_port + channel`
    pub base_port: u16,
    /// numeric port offset isolating independent bus instances (one per
    ///  conference session) on the shared group
    pub channel: u16,
    /// interface the multicast traffic egresses on. The bus never leaves the
    ///  host, so this defaults to loopback and datagrams are sent with TTL 0.
    pub multicast_interface: Ipv4Addr,

    /// sender addresses accepted by the same-host source filter, in addition
    ///  to loopback. Transport is unauthenticated, so anything not listed here
    ///  is dropped as a potential security violation.
    pub allowed_sources: Vec<IpAddr>,

    pub first_retransmit_after: Duration,
    pub second_retransmit_after: Duration,
    pub third_retransmit_after: Duration,
    pub delivery_failure_after: Duration,
    /// cadence of the retransmit pass; each pass acts on at most one record
    pub retransmit_pass_interval: Duration,

    pub hello_interval: Duration,

    pub rendezvous_poll_interval: Duration,
    pub rendezvous_give_up_timeout: Duration,
}

impl BusConfig {
    pub fn new(channel: u16) -> BusConfig {
        BusConfig {
            multicast_group: Ipv4Addr::new(224, 255, 222, 239),
            base_port: 47000,
            channel,
            multicast_interface: Ipv4Addr::LOCALHOST,
            allowed_sources: Vec::new(),
            first_retransmit_after: Duration::from_millis(250),
            second_retransmit_after: Duration::from_millis(500),
            third_retransmit_after: Duration::from_millis(750),
            delivery_failure_after: Duration::from_millis(1000),
            retransmit_pass_interval: Duration::from_millis(25),
            hello_interval: Duration::from_secs(1),
            rendezvous_poll_interval: Duration::from_millis(100),
            rendezvous_give_up_timeout: Duration::from_secs(30),
        }
    }

    pub fn group_port(&self) -> u16 {
        self.base_port + self.channel
    }
}
