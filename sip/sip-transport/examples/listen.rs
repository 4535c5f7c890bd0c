use sip_transport::{
    Bootstrap, Channel, ChainNames, ConnectionLink, EndpointOptions, InboundChannel,
    InboundChannelFactory, ListeningPoint, LogPublisher, MessageBuffer, SipEndpoint,
    StartupCoordinator,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Prints everything received on a channel
struct PrintLink {
    channel: String,
}

impl ConnectionLink for PrintLink {
    fn receive(&self, buffer: MessageBuffer, sender: Option<SocketAddr>) {
        let text = String::from_utf8_lossy(buffer.bytes());

        match sender {
            Some(sender) => println!("{} <- {sender}:\n{text}", self.channel),
            None => println!("{}:\n{text}", self.channel),
        }
    }

    fn close(&self, error: Option<&io::Error>) {
        println!("{} closed, error={error:?}", self.channel);
    }
}

struct PrintInbound;

impl InboundChannel for PrintInbound {
    fn connection_link(&self, channel: &Arc<Channel>) -> Arc<dyn ConnectionLink> {
        Arc::new(PrintLink {
            channel: channel.to_string(),
        })
    }
}

struct PrintFactory;

impl InboundChannelFactory for PrintFactory {
    fn create(&self, _: &Arc<ListeningPoint>, names: &ChainNames) -> Arc<dyn InboundChannel> {
        println!("creating {}", names.sip());

        Arc::new(PrintInbound)
    }
}

#[tokio::main]
async fn main() -> sip_transport::Result<()> {
    tracing_subscriber::fmt::init();

    let bootstrap = Bootstrap::builder(StartupCoordinator::new()).build();
    bootstrap.start(tokio::runtime::Handle::current());

    let options = EndpointOptions::new("defaultSipEndpoint", "0.0.0.0")
        .with_tcp_port(5060)
        .with_udp_port(5060);

    let endpoint = SipEndpoint::new(
        "sip",
        options,
        bootstrap.clone(),
        Arc::new(PrintFactory),
        Arc::new(LogPublisher),
    )?;

    endpoint.update().await?;
    bootstrap.signal_started();

    std::future::pending::<()>().await;

    Ok(())
}
