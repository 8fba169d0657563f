//! Two nodes in one process, talking over real UDP sockets. The first node sends a number of
//!  messages, the second echoes them back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use overlay_mux::channel::handler::{ChannelEvent, ForwardingInitializer};
use overlay_mux::config::{MultiplexerConfig, UdpTransportConfig};
use overlay_mux::event_loop::EventLoopGroup;
use overlay_mux::identity::{Identity, PeerAddress};
use overlay_mux::multiplexer::registry::IntraProcessRegistry;
use overlay_mux::multiplexer::{ChannelMultiplexer, MultiplexerContext};
use overlay_mux::routing::PeerPaths;
use overlay_mux::transport::udp::UdpTransport;
use overlay_mux::transport::DatagramSource;
use tokio::sync::mpsc;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:17001")]
    first_address: String,

    #[clap(long, default_value = "127.0.0.1:17002")]
    second_address: String,

    #[clap(short, long, default_value_t = 10)]
    num_messages: u32,

    /// limits outbound messages per second on the sending node
    #[clap(long)]
    rate: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct Node {
    multiplexer: Arc<ChannelMultiplexer>,
    transport: Arc<UdpTransport>,
    paths: Arc<PeerPaths>,
    events: mpsc::UnboundedReceiver<(PeerAddress, ChannelEvent)>,
}

async fn start_node(address: &str, config: MultiplexerConfig) -> anyhow::Result<Node> {
    let transport = Arc::new(UdpTransport::bind(&UdpTransportConfig::new(address.parse()?)).await?);
    let paths = Arc::new(PeerPaths::new());
    let (initializer, events) = ForwardingInitializer::new();

    let multiplexer = ChannelMultiplexer::bind(Identity::generate(), config, MultiplexerContext {
        transport: transport.clone(),
        resolver: paths.clone(),
        activity_listener: paths.clone(),
        // one registry per node, so traffic really goes through the sockets
        registry: Arc::new(IntraProcessRegistry::new()),
        event_loops: Arc::new(EventLoopGroup::new(2)?),
        initializer: Arc::new(initializer),
    })?;

    let cloned_transport = transport.clone();
    let handler = multiplexer.clone();
    tokio::spawn(async move {
        if let Err(e) = cloned_transport.recv_loop(handler).await {
            tracing::error!(error = %e, "receive loop terminated");
        }
    });

    info!(address = ?multiplexer.address(), endpoint = ?transport.local_addr(), "node started");
    Ok(Node { multiplexer, transport, paths, events })
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let mut first_config = MultiplexerConfig::new();
    first_config.max_outbound_messages_per_second = args.rate;

    let mut first = start_node(&args.first_address, first_config).await?;
    let second = start_node(&args.second_address, MultiplexerConfig::new()).await?;

    first.paths.add_path(second.multiplexer.address(), "static", 0, second.transport.local_addr());
    second.paths.add_path(first.multiplexer.address(), "static", 0, first.transport.local_addr());

    let echo_multiplexer = second.multiplexer.clone();
    let mut echo_events = second.events;
    let echo = tokio::spawn(async move {
        while let Some((peer, event)) = echo_events.recv().await {
            if let ChannelEvent::Read(payload) = event {
                let channel = echo_multiplexer.get_or_create(peer)?;
                let _ = channel.write_and_flush(payload)?;
            }
        }
        anyhow::Ok(())
    });

    let channel = first.multiplexer.serve(second.multiplexer.address()).await?;
    for i in 0..args.num_messages {
        let _ = channel.write(Bytes::from(format!("message #{}", i)))?;
    }
    channel.flush();

    let mut num_received = 0;
    while num_received < args.num_messages {
        let event = tokio::time::timeout(Duration::from_secs(10), first.events.recv()).await
            .map_err(|_| anyhow!("timeout waiting for echo"))?;
        match event {
            Some((_, ChannelEvent::Read(payload))) => {
                info!(payload = %String::from_utf8_lossy(&payload), "echo received");
                num_received += 1;
            }
            Some(_) => {}
            None => bail!("first node's event stream terminated"),
        }
    }

    first.transport.cancel_recv_loop();
    second.transport.cancel_recv_loop();
    first.multiplexer.close().await?;
    second.multiplexer.close().await?;
    echo.abort();

    info!(num_received, "done");
    Ok(())
}
