//! The startup handshake that brings up the three-process topology safely
//!  despite UDP's lack of delivery guarantees and multicast self-reception,
//!  built entirely from ordinary bus commands.
//!
//! The controller picks a random token per subprocess and launches it with
//!  the controller's bus address and that token. Both sides then run the same
//!  primitive symmetrically: the side that waits ([rendezvous_waiting]) keeps
//!  sending unreliable `mbus.waiting(token)` until `mbus.go(token)` arrives;
//!  the side that confirms ([rendezvous_go]) polls for `mbus.waiting(token)`
//!  and answers with a reliable `mbus.go(token)`, emitting its own unreliable
//!  `mbus.waiting(token)` as a liveness signal while it polls. A freshly
//!  started subprocess additionally waits until it has observed *any* message
//!  from the controller's address before it starts announcing, proving the
//!  controller is alive.
//!
//! Shutdown mirrors this: the controller sends `mbus.quit` reliably to each
//!  subprocess and waits for the acknowledgement ([shutdown_peer]); a cleanly
//!  exiting subprocess announces `mbus.bye` before closing its endpoint
//!  (`Endpoint::announce_bye`).

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::bus::address::Address;
use crate::bus::endpoint::{CommandHandler, Endpoint, MBUS_GO, MBUS_QUIT, MBUS_WAITING};
use crate::bus::error::MbusError;
use crate::bus::wire::{Command, WireValue};

/// A [CommandHandler] decorator that records what the rendezvous primitives
///  poll for - observed sources, `mbus.waiting` announcements and `mbus.go`
///  confirmations - and forwards every command to the application handler.
pub struct RendezvousObserver {
    inner: Arc<dyn CommandHandler>,
    state: std::sync::Mutex<ObserverState>,
}

#[derive(Default)]
struct ObserverState {
    seen_sources: Vec<Address>,
    waiting: Vec<(String, Address)>,
    go_tokens: Vec<String>,
}

impl RendezvousObserver {
    pub fn new(inner: Arc<dyn CommandHandler>) -> RendezvousObserver {
        RendezvousObserver {
            inner,
            state: std::sync::Mutex::new(ObserverState::default()),
        }
    }

    /// Has any message from a source matching `addr` been observed?
    pub fn has_seen(&self, addr: &Address) -> bool {
        self.state.lock().unwrap().seen_sources.iter().any(|s| s.matches(addr))
    }

    pub fn go_received(&self, token: &str) -> bool {
        self.state.lock().unwrap().go_tokens.iter().any(|t| t == token)
    }

    /// Removes and returns the source of a recorded `mbus.waiting(token)`.
    ///  Announcements from `ignore` (ourselves, echoed back by multicast
    ///  loopback) are skipped: both sides emit the same token, and answering
    ///  our own announcement would complete the handshake with nobody.
    pub fn take_waiting(&self, token: &str, ignore: &Address) -> Option<Address> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .waiting
            .iter()
            .position(|(t, source)| t == token && source != ignore)?;
        Some(state.waiting.remove(pos).1)
    }
}

fn first_string_arg(command: &Command) -> Option<&str> {
    match command.args.first() {
        Some(WireValue::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

#[async_trait]
impl CommandHandler for RendezvousObserver {
    async fn on_command(&self, source: &Address, command: &Command) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.seen_sources.contains(source) {
                state.seen_sources.push(source.clone());
            }
            match command.name.as_str() {
                MBUS_WAITING => {
                    if let Some(token) = first_string_arg(command) {
                        debug!("observed mbus.waiting({:?}) from {:?}", token, source);
                        let token = token.to_string();
                        state.waiting.push((token, source.clone()));
                    }
                }
                MBUS_GO => {
                    if let Some(token) = first_string_arg(command) {
                        debug!("observed mbus.go({:?}) from {:?}", token, source);
                        let token = token.to_string();
                        state.go_tokens.push(token);
                    }
                }
                _ => {}
            }
        }
        self.inner.on_command(source, command).await;
    }
}

fn waiting_command(token: &str) -> Command {
    Command::new(MBUS_WAITING, vec![WireValue::Str(token.to_string())])
}

fn go_command(token: &str) -> Command {
    Command::new(MBUS_GO, vec![WireValue::Str(token.to_string())])
}

/// The waiting side of the handshake: first waits until any message from
///  `peer` has been observed (proving liveness), then announces an unreliable
///  `mbus.waiting(token)` at a steady interval until `mbus.go(token)` arrives.
///
/// Terminates in a bounded number of iterations even when every other
///  datagram is lost in either direction; a dead peer turns into
///  [MbusError::RendezvousTimeout] after the configured give-up timeout.
pub async fn rendezvous_waiting(
    endpoint: &Endpoint,
    observer: &RendezvousObserver,
    peer: &Address,
    token: &str,
) -> anyhow::Result<()> {
    let config = endpoint.config();
    let deadline = Instant::now() + config.rendezvous_give_up_timeout;

    while !observer.has_seen(peer) {
        if Instant::now() > deadline {
            return Err(MbusError::RendezvousTimeout { token: token.to_string() }.into());
        }
        sleep(config.rendezvous_poll_interval).await;
    }
    debug!("peer {:?} is alive, announcing mbus.waiting({:?})", peer, token);

    loop {
        if observer.go_received(token) {
            info!("rendezvous {:?} complete", token);
            return Ok(());
        }
        endpoint.send(peer.clone(), waiting_command(token)).await?;
        if Instant::now() > deadline {
            return Err(MbusError::RendezvousTimeout { token: token.to_string() }.into());
        }
        sleep(config.rendezvous_poll_interval).await;
    }
}

/// The confirming side of the handshake: polls until `mbus.waiting(token)` is
///  observed from some source, then replies with a reliable `mbus.go(token)`
///  to that source and returns it. While polling it emits its own unreliable
///  `mbus.waiting(token)` toward `peer`, which doubles as the liveness proof
///  a freshly started subprocess waits for.
pub async fn rendezvous_go(
    endpoint: &Endpoint,
    observer: &RendezvousObserver,
    peer: &Address,
    token: &str,
) -> anyhow::Result<Address> {
    let config = endpoint.config();
    let deadline = Instant::now() + config.rendezvous_give_up_timeout;
    let myself = endpoint
        .primary_address()
        .await
        .ok_or_else(|| anyhow!("endpoint has no self address"))?;

    loop {
        if let Some(subprocess) = observer.take_waiting(token, &myself) {
            info!("rendezvous {:?}: confirming {:?}", token, subprocess);
            endpoint.send_reliable(subprocess.clone(), go_command(token)).await?;
            return Ok(subprocess);
        }
        endpoint.send(peer.clone(), waiting_command(token)).await?;
        if Instant::now() > deadline {
            return Err(MbusError::RendezvousTimeout { token: token.to_string() }.into());
        }
        sleep(config.rendezvous_poll_interval).await;
    }
}

/// Sends `mbus.quit` reliably to `peer` and waits until it is acknowledged.
pub async fn shutdown_peer(endpoint: &Endpoint, peer: &Address) -> anyhow::Result<()> {
    let seq = endpoint.send_reliable(peer.clone(), Command::new(MBUS_QUIT, vec![])).await?;
    endpoint.await_acked(seq).await
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::bus::config::BusConfig;
    use crate::test_util::{RecordingHandler, TestHub};

    use super::*;

    fn controller_addr() -> Address {
        Address::parse("media:audio module:control app:rat instance:100")
    }

    fn engine_addr() -> Address {
        Address::parse("media:audio module:engine app:rat instance:200")
    }

    fn engine_pattern() -> Address {
        Address::parse("media:audio module:engine")
    }

    struct Node {
        endpoint: Arc<Endpoint>,
        observer: Arc<RendezvousObserver>,
        handler: Arc<RecordingHandler>,
    }

    async fn node(transport: Arc<dyn crate::bus::transport::Transport>, addr: Address) -> Node {
        let handler = Arc::new(RecordingHandler::new());
        let observer = Arc::new(RendezvousObserver::new(handler.clone()));
        let endpoint = Arc::new(Endpoint::new(
            Arc::new(BusConfig::new(0)),
            transport,
            observer.clone(),
        ));
        endpoint.add_address(addr).await;

        let run_endpoint = endpoint.clone();
        tokio::spawn(async move { run_endpoint.run().await });

        Node { endpoint, observer, handler }
    }

    async fn run_handshake(controller: &Node, engine: &Node, token: &str) -> Address {
        let c_endpoint = controller.endpoint.clone();
        let c_observer = controller.observer.clone();
        let c_token = token.to_string();
        let confirm = tokio::spawn(async move {
            rendezvous_go(&c_endpoint, &c_observer, &engine_pattern(), &c_token).await
        });

        let confirmed = timeout(
            Duration::from_secs(60),
            rendezvous_waiting(&engine.endpoint, &engine.observer, &controller_addr(), token),
        )
        .await
        .expect("waiting side timed out");
        confirmed.unwrap();

        timeout(Duration::from_secs(60), confirm)
            .await
            .expect("confirming side timed out")
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_completes() {
        let hub = TestHub::new();
        let controller = node(hub.attach(), controller_addr()).await;
        let engine = node(hub.attach(), engine_addr()).await;

        let subprocess = run_handshake(&controller, &engine, "tok-1").await;
        assert_eq!(subprocess, engine_addr());

        // once confirmed, the engine stops announcing
        let waiting_count = || {
            hub.sent_datagrams()
                .iter()
                .filter(|d| {
                    let msg = crate::bus::wire::Message::parse(std::str::from_utf8(d).unwrap()).unwrap();
                    msg.source == engine_addr() && msg.commands.iter().any(|c| c.name == MBUS_WAITING)
                })
                .count()
        };
        let before = waiting_count();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(waiting_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_survives_loss_toward_controller() {
        let hub = TestHub::new();
        let controller = node(hub.attach(), controller_addr()).await;
        // the engine loses every other datagram it sends
        let engine = node(hub.attach_lossy(), engine_addr()).await;

        let subprocess = run_handshake(&controller, &engine, "tok-2").await;
        assert_eq!(subprocess, engine_addr());
        assert!(!controller.endpoint.is_shut_down());
        assert!(!engine.endpoint.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_survives_loss_toward_subprocess() {
        let hub = TestHub::new();
        // the controller loses every other datagram it sends
        let controller = node(hub.attach_lossy(), controller_addr()).await;
        let engine = node(hub.attach(), engine_addr()).await;

        let subprocess = run_handshake(&controller, &engine, "tok-3").await;
        assert_eq!(subprocess, engine_addr());
        assert!(!controller.endpoint.is_shut_down());
        assert!(!engine.endpoint.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_side_times_out_without_peer() {
        let hub = TestHub::new();
        let engine = node(hub.attach(), engine_addr()).await;

        let result = rendezvous_waiting(
            &engine.endpoint,
            &engine.observer,
            &controller_addr(),
            "tok-4",
        )
        .await;

        match result.unwrap_err().downcast_ref::<MbusError>() {
            Some(MbusError::RendezvousTimeout { token }) => assert_eq!(token, "tok-4"),
            other => panic!("expected RendezvousTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_quit_is_acknowledged_and_stops_the_peer() {
        let hub = TestHub::new();
        let controller = node(hub.attach(), controller_addr()).await;
        let engine = node(hub.attach(), engine_addr()).await;
        run_handshake(&controller, &engine, "tok-5").await;

        timeout(
            Duration::from_secs(10),
            shutdown_peer(&controller.endpoint, &engine_addr()),
        )
        .await
        .expect("shutdown timed out")
        .unwrap();

        assert!(engine.endpoint.is_shut_down());
        assert_eq!(controller.endpoint.outstanding().await, 0);
        assert_eq!(engine.handler.commands().last().unwrap().1.name, MBUS_QUIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_waiting_announcement_is_ignored() {
        let handler = Arc::new(RecordingHandler::new());
        let observer = RendezvousObserver::new(handler);

        let myself = controller_addr();
        let them = engine_addr();

        observer
            .on_command(&myself, &waiting_command("tok"))
            .await;
        assert_eq!(observer.take_waiting("tok", &myself), None);

        observer.on_command(&them, &waiting_command("tok")).await;
        assert_eq!(observer.take_waiting("tok", &myself), Some(them));
        // consumed
        assert_eq!(observer.take_waiting("tok", &myself), None);
    }
}
