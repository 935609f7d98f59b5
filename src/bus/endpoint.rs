use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::bus::address::Address;
use crate::bus::config::BusConfig;
use crate::bus::error::MbusError;
use crate::bus::retransmit::{OutstandingAck, PassAction, RetransmitQueue};
use crate::bus::transport::{MulticastTransport, Transport};
use crate::bus::wire::{Command, Message};

pub const MBUS_HELLO: &str = "mbus.hello";
pub const MBUS_WAITING: &str = "mbus.waiting";
pub const MBUS_GO: &str = "mbus.go";
pub const MBUS_QUIT: &str = "mbus.quit";
pub const MBUS_BYE: &str = "mbus.bye";

/// Overflowing the piggyback queue is a programming error (a caller queueing
///  without ever sending), not a recoverable runtime condition.
const MAX_PIGGYBACK: usize = 64;

/// Application-side handler, invoked once per received (command, arguments)
///  pair, in datagram order.
///
/// This is a blocking call, holding up the endpoint's driving loop.
///  Non-trivial work should be offloaded by the handler implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn on_command(&self, source: &Address, command: &Command);
}

/// Told about reliable messages whose retransmission budget is exhausted.
///  If no handler is installed, [Endpoint::run] instead terminates with
///  [MbusError::DeliveryFailed] and the host decides what to do.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryFailureHandler: Send + Sync + 'static {
    async fn on_delivery_failure(&self, seq: u64, dest: &Address);
}

/// A process's instance of the message bus, bound to one multicast channel.
///  Created once at process start; all bus operations go through it.
pub struct Endpoint {
    config: Arc<BusConfig>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn CommandHandler>,
    failure_handler: Option<Arc<dyn DeliveryFailureHandler>>,
    inner: Mutex<EndpointInner>,
    exit: AtomicBool,
    exit_notify: Notify,
}

struct EndpointInner {
    addresses: Vec<Address>,
    next_seq: u64,
    piggyback: Vec<Command>,
    outstanding: RetransmitQueue,
    /// failed reliable sends, kept so [Endpoint::await_acked] can report them
    failed: FxHashMap<u64, (Address, u8)>,
}

impl Endpoint {
    pub fn new(
        config: Arc<BusConfig>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn CommandHandler>,
    ) -> Endpoint {
        Endpoint {
            config: config.clone(),
            transport,
            handler,
            failure_handler: None,
            inner: Mutex::new(EndpointInner {
                addresses: Vec::new(),
                next_seq: 0,
                piggyback: Vec::new(),
                outstanding: RetransmitQueue::new(config),
                failed: FxHashMap::default(),
            }),
            exit: AtomicBool::new(false),
            exit_notify: Notify::new(),
        }
    }

    /// Binds a [MulticastTransport] for the configured channel.
    pub async fn bind(config: BusConfig, handler: Arc<dyn CommandHandler>) -> anyhow::Result<Endpoint> {
        let config = Arc::new(config);
        let transport = Arc::new(MulticastTransport::bind(&config).await?);
        Ok(Endpoint::new(config, transport, handler))
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn DeliveryFailureHandler>) -> Endpoint {
        self.failure_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Registers a self address. The first registered address becomes the
    ///  source address of outgoing messages; a process may register several
    ///  (e.g. a specific and a less specific one).
    pub async fn add_address(&self, address: Address) {
        self.inner.lock().await.addresses.push(address);
    }

    pub async fn primary_address(&self) -> Option<Address> {
        self.inner.lock().await.addresses.first().cloned()
    }

    /// Queues a command to piggyback on the next send, reliable or not.
    pub async fn queue(&self, command: Command) {
        let mut inner = self.inner.lock().await;
        assert!(
            inner.piggyback.len() < MAX_PIGGYBACK,
            "piggyback queue overflow: {} commands queued without a send",
            MAX_PIGGYBACK
        );
        inner.piggyback.push(command);
    }

    /// Unreliable send: transmits the piggyback queue plus `command` in one
    ///  datagram, with no tracking. Returns the message's sequence number.
    pub async fn send(&self, dest: Address, command: Command) -> anyhow::Result<u64> {
        self.do_send(false, dest, command).await
    }

    /// Reliable send: additionally creates an Outstanding-Ack record (with a
    ///  private copy of the whole datagram) before transmitting, and the
    ///  message is retransmitted until acknowledged or failed.
    pub async fn send_reliable(&self, dest: Address, command: Command) -> anyhow::Result<u64> {
        self.do_send(true, dest, command).await
    }

    async fn do_send(&self, reliable: bool, dest: Address, command: Command) -> anyhow::Result<u64> {
        let (seq, datagram) = {
            let mut inner = self.inner.lock().await;
            let source = inner
                .addresses
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("endpoint has no self address"))?;

            let seq = inner.next_seq;
            inner.next_seq += 1;

            let mut commands: Vec<Command> = inner.piggyback.drain(..).collect();
            commands.push(command);

            let msg = Message {
                seq,
                reliable,
                source: source.clone(),
                dest: dest.clone(),
                acks: Vec::new(),
                commands,
            };
            let datagram = Bytes::from(msg.encode());

            if reliable {
                inner.outstanding.register(OutstandingAck {
                    seq,
                    source,
                    dest,
                    datagram: datagram.clone(),
                    sent_at: Instant::now(),
                    retransmits: 0,
                });
            }
            (seq, datagram)
        };
        // NB: the piggyback queue is drained (and the record registered)
        //  before the datagram hits the wire

        trace!("sending message {}: {:?}", seq, datagram);
        self.transport.send(&datagram).await?;
        Ok(seq)
    }

    /// Minimal ack datagram: fresh sequence number, unreliable, no commands,
    ///  bypassing the piggyback queue.
    async fn send_ack(&self, dest: Address, acked_seq: u64) -> anyhow::Result<()> {
        let datagram = {
            let mut inner = self.inner.lock().await;
            let source = inner
                .addresses
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("endpoint has no self address"))?;

            let seq = inner.next_seq;
            inner.next_seq += 1;

            Bytes::from(
                Message {
                    seq,
                    reliable: false,
                    source,
                    dest,
                    acks: vec![acked_seq],
                    commands: Vec::new(),
                }
                .encode(),
            )
        };
        self.transport.send(&datagram).await
    }

    pub async fn outstanding(&self) -> usize {
        self.inner.lock().await.outstanding.len()
    }

    /// Waits until the reliable message `seq` is acknowledged. Fails with
    ///  [MbusError::DeliveryFailed] if its retransmission budget ran out.
    pub async fn await_acked(&self, seq: u64) -> anyhow::Result<()> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some((dest, retransmits)) = inner.failed.remove(&seq) {
                    return Err(MbusError::DeliveryFailed { seq, dest, retransmits }.into());
                }
                if !inner.outstanding.contains(seq) {
                    return Ok(());
                }
            }
            if self.is_shut_down() {
                return Err(anyhow!("endpoint was shut down while waiting for ack of {}", seq));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cooperative shutdown: makes [Endpoint::run] return after its current
    ///  iteration.
    pub fn shut_down(&self) {
        self.exit.store(true, Ordering::Release);
        self.exit_notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Announces `mbus.bye` (unreliable, to everyone) and shuts down. The
    ///  clean way for a subprocess to leave the bus.
    pub async fn announce_bye(&self) -> anyhow::Result<()> {
        let result = self.send(Address::empty(), Command::new(MBUS_BYE, vec![])).await;
        self.shut_down();
        result.map(|_| ())
    }

    /// The endpoint's driving loop: alternates receiving, the retransmit pass
    ///  and the periodic keep-alive until shut down. Run it on one owning
    ///  task per endpoint; all bus state is only touched from here and from
    ///  the send calls, each behind the endpoint's lock.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut retransmit_tick = interval(self.config.retransmit_pass_interval);
        let mut hello_tick = interval(self.config.hello_interval);

        loop {
            if self.is_shut_down() {
                info!("endpoint shutting down");
                return Ok(());
            }

            tokio::select! {
                _ = self.exit_notify.notified() => {
                }
                received = self.transport.recv() => {
                    match received {
                        Ok(datagram) => self.on_datagram(&datagram).await,
                        Err(e) => {
                            error!("transport error: {}", e);
                            return Err(e);
                        }
                    }
                }
                _ = retransmit_tick.tick() => {
                    self.retransmit_pass().await?;
                }
                _ = hello_tick.tick() => {
                    if let Err(e) = self.send_hello().await {
                        debug!("keep-alive not sent: {:#}", e);
                    }
                }
            }
        }
    }

    async fn send_hello(&self) -> anyhow::Result<u64> {
        // the empty destination pattern matches every endpoint
        self.send(Address::empty(), Command::new(MBUS_HELLO, vec![])).await
    }

    /// Inbound dispatch for one datagram (the source filter already ran in
    ///  the transport). Malformed input is dropped with a diagnostic; the
    ///  protocol is sender-driven, so there is no receiver-side retry.
    async fn on_datagram(&self, datagram: &[u8]) {
        let text = match std::str::from_utf8(datagram) {
            Ok(text) => text,
            Err(_) => {
                warn!("dropping datagram that is not valid UTF-8");
                return;
            }
        };
        let msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed datagram: {:#}", e);
                return;
            }
        };
        trace!("received message {} from {:?} for {:?}", msg.seq, msg.source, msg.dest);

        let addresses = self.inner.lock().await.addresses.clone();
        for self_addr in addresses.iter().filter(|a| a.matches(&msg.dest)) {
            trace!("message {} matches self address {:?}", msg.seq, self_addr);

            {
                let mut inner = self.inner.lock().await;
                for &acked in &msg.acks {
                    if !inner.outstanding.apply_ack(acked, &msg.source, &msg.dest) {
                        debug!("ack for unknown message {} from {:?} - duplicate or late, ignoring", acked, msg.source);
                    }
                }
            }

            if msg.reliable {
                if let Err(e) = self.send_ack(msg.source.clone(), msg.seq).await {
                    warn!("could not acknowledge message {} to {:?}: {:#}", msg.seq, msg.source, e);
                }
            }

            for command in &msg.commands {
                if command.name == MBUS_QUIT {
                    info!("received mbus.quit from {:?}", msg.source);
                    self.shut_down();
                }
                self.handler.on_command(&msg.source, command).await;
            }
        }
    }

    async fn retransmit_pass(&self) -> anyhow::Result<()> {
        let action = self.inner.lock().await.outstanding.sweep(Instant::now());
        match action {
            None => Ok(()),
            Some(PassAction::Retransmit { seq, datagram }) => {
                if let Err(e) = self.transport.send(&datagram).await {
                    warn!("retransmission of message {} failed: {:#}", seq, e);
                }
                Ok(())
            }
            Some(PassAction::Fail { seq, dest, retransmits }) => {
                self.inner.lock().await.failed.insert(seq, (dest.clone(), retransmits));
                match &self.failure_handler {
                    Some(handler) => {
                        handler.on_delivery_failure(seq, &dest).await;
                        Ok(())
                    }
                    None => {
                        // an unreachable peer cannot be tolerated in this
                        //  topology; without a handler the host gets a
                        //  distinguished error and decides
                        self.shut_down();
                        Err(MbusError::DeliveryFailed { seq, dest, retransmits }.into())
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn piggyback_len(&self) -> usize {
        self.inner.lock().await.piggyback.len()
    }
}
