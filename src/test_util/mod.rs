//! In-memory stand-ins for the multicast transport, used by tests: a hub
//!  that redelivers every sent datagram to all attached endpoints (including
//!  the sender, like multicast loopback does) and can drop datagrams
//!  deterministically to simulate a lossy network. Part of the regular module
//!  tree so application tests can use it too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::bus::address::Address;
use crate::bus::endpoint::{CommandHandler, MBUS_HELLO};
use crate::bus::transport::Transport;
use crate::bus::wire::Command;

/// One multicast channel in memory.
pub struct TestHub {
    state: Arc<HubState>,
}

struct HubState {
    peers: std::sync::Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    /// every datagram any attached transport attempted to send, in order,
    ///  including ones the loss simulation then dropped
    sent: std::sync::Mutex<Vec<Bytes>>,
}

impl TestHub {
    pub fn new() -> TestHub {
        TestHub {
            state: Arc::new(HubState {
                peers: std::sync::Mutex::new(Vec::new()),
                sent: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn attach(&self) -> Arc<HubTransport> {
        self.do_attach(false)
    }

    /// Attaches a transport that loses every other datagram it sends,
    ///  starting with the first one.
    pub fn attach_lossy(&self) -> Arc<HubTransport> {
        self.do_attach(true)
    }

    fn do_attach(&self, drop_every_other: bool) -> Arc<HubTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.peers.lock().unwrap().push(tx);
        Arc::new(HubTransport {
            state: self.state.clone(),
            rx: tokio::sync::Mutex::new(rx),
            drop_every_other,
            send_counter: AtomicU64::new(0),
        })
    }

    pub fn sent_datagrams(&self) -> Vec<Bytes> {
        self.state.sent.lock().unwrap().clone()
    }
}

impl Default for TestHub {
    fn default() -> Self {
        TestHub::new()
    }
}

pub struct HubTransport {
    state: Arc<HubState>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    drop_every_other: bool,
    send_counter: AtomicU64,
}

impl HubTransport {
    /// Delivers raw bytes to every attached transport, bypassing the send
    ///  log and the loss simulation - for feeding an endpoint malformed or
    ///  hand-crafted datagrams.
    pub async fn inject(&self, datagram: &[u8]) {
        self.state.deliver(Bytes::copy_from_slice(datagram));
    }
}

impl HubState {
    fn deliver(&self, datagram: Bytes) {
        for peer in self.peers.lock().unwrap().iter() {
            // a peer whose endpoint is gone just stops receiving
            let _ = peer.send(datagram.clone());
        }
    }
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let datagram = Bytes::copy_from_slice(datagram);
        self.state.sent.lock().unwrap().push(datagram.clone());

        let n = self.send_counter.fetch_add(1, Ordering::AcqRel);
        if self.drop_every_other && n % 2 == 0 {
            return Ok(()); // lost on the wire - UDP reports no error
        }

        self.state.deliver(datagram);
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<BytesMut> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => Ok(BytesMut::from(datagram.as_ref())),
            None => Err(anyhow!("test hub closed")),
        }
    }
}

/// A [CommandHandler] recording everything it sees, apart from the periodic
///  `mbus.hello` keep-alives (noise for assertions).
pub struct RecordingHandler {
    commands: std::sync::Mutex<Vec<(Address, Command)>>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        RecordingHandler {
            commands: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<(Address, Command)> {
        self.commands.lock().unwrap().clone()
    }

    /// Polls until at least `n` commands were recorded. Pair with an outer
    ///  `tokio::time::timeout` when failure is an option.
    pub async fn wait_for_commands(&self, n: usize) -> Vec<(Address, Command)> {
        loop {
            let commands = self.commands();
            if commands.len() >= n {
                return commands;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        RecordingHandler::new()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn on_command(&self, source: &Address, command: &Command) {
        if command.name == MBUS_HELLO {
            return;
        }
        self.commands.lock().unwrap().push((source.clone(), command.clone()));
    }
}
