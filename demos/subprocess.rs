use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use mbus::bus::address::Address;
use mbus::bus::config::BusConfig;
use mbus::bus::endpoint::{CommandHandler, Endpoint};
use mbus::bus::wire::Command;
use mbus::rendezvous::{rendezvous_waiting, RendezvousObserver};

/// Subprocess side of the demo session (standing in for the media engine):
///  joins the controller via the rendezvous, then serves bus commands until
///  the controller sends mbus.quit.
#[derive(Parser)]
struct Args {
    /// bus channel (port offset) of this session
    #[arg(long, default_value_t = 0)]
    channel: u16,
    /// the controller's bus address, as printed by the controller
    #[arg(long)]
    controller: String,
    /// one-time rendezvous token handed out by the controller
    #[arg(long)]
    token: String,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

struct EngineHandler {}

#[async_trait::async_trait]
impl CommandHandler for EngineHandler {
    async fn on_command(&self, source: &Address, command: &Command) {
        info!("{:?} from {:?}", command, source);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let handler = Arc::new(EngineHandler {});
    let observer = Arc::new(RendezvousObserver::new(handler));
    let endpoint = Arc::new(Endpoint::bind(BusConfig::new(args.channel), observer.clone()).await?);
    endpoint
        .add_address(Address::parse(&format!(
            "media:audio module:engine app:rat instance:{}",
            std::process::id()
        )))
        .await;

    let run = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.run().await })
    };

    rendezvous_waiting(&endpoint, &observer, &Address::parse(&args.controller), &args.token).await?;
    info!("controller confirmed us, serving bus commands until mbus.quit");

    run.await??;

    endpoint.announce_bye().await?;
    info!("bye");
    Ok(())
}
