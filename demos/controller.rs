use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use mbus::bus::address::Address;
use mbus::bus::config::BusConfig;
use mbus::bus::endpoint::{CommandHandler, Endpoint};
use mbus::bus::wire::{Command, WireValue};
use mbus::rendezvous::{rendezvous_go, shutdown_peer, RendezvousObserver};
use mbus::util::random::{Random, RngRandom};

/// Controller side of a two-process demo session: launches nothing itself,
///  but prints the command line for the subprocess, waits for it via the
///  rendezvous, configures it, and shuts it down again.
#[derive(Parser)]
struct Args {
    /// bus channel (port offset) of this session
    #[arg(long, default_value_t = 0)]
    channel: u16,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

struct LoggingHandler {}

#[async_trait::async_trait]
impl CommandHandler for LoggingHandler {
    async fn on_command(&self, source: &Address, command: &Command) {
        info!("{:?} from {:?}", command, source);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let handler = Arc::new(LoggingHandler {});
    let observer = Arc::new(RendezvousObserver::new(handler));
    let endpoint = Arc::new(Endpoint::bind(BusConfig::new(args.channel), observer.clone()).await?);
    endpoint
        .add_address(Address::parse(&format!(
            "media:audio module:control app:rat instance:{}",
            std::process::id()
        )))
        .await;

    let token = RngRandom::rendezvous_token();
    let controller_addr = endpoint.primary_address().await.expect("address was just registered");
    info!("launch the engine subprocess with:");
    info!(
        "  cargo run --example subprocess -- --channel {} --controller '{}' --token {}",
        args.channel, controller_addr, token
    );

    let run = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.run().await })
    };

    let engine = rendezvous_go(
        &endpoint,
        &observer,
        &Address::parse("media:audio module:engine"),
        &token,
    )
    .await?;
    info!("engine confirmed: {:?}", engine);

    endpoint
        .queue(Command::new(
            "rtp.addr",
            vec![
                WireValue::Str("224.2.0.1".to_string()),
                WireValue::Int(5004),
                WireValue::Int(5004),
                WireValue::Int(16),
            ],
        ))
        .await;
    let seq = endpoint
        .send_reliable(
            engine.clone(),
            Command::new("session.title", vec![WireValue::Str("mbus demo session".to_string())]),
        )
        .await?;
    endpoint.await_acked(seq).await?;
    info!("session configured, shutting the engine down again");

    shutdown_peer(&endpoint, &engine).await?;
    endpoint.shut_down();
    run.await??;
    Ok(())
}
