//! Listener transport of the EZK SIP Stack
//!
//! Owns the listening sockets of SIP endpoints, frames the bytes read from them into
//! pooled [`MessageBuffer`]s and binds every live connection to the SIP-layer
//! [`ConnectionLink`] handling it. Endpoints describe their listeners as [`Chain`]s,
//! which are (re)built whenever the endpoint settings change.
//!
//! Listeners are only bound after the host signalled its startup through the
//! [`StartupCoordinator`].
//!
//! ```no_run
//! # async fn example(
//! #     factory: std::sync::Arc<dyn sip_transport::InboundChannelFactory>,
//! # ) -> sip_transport::Result<()> {
//! use sip_transport::{Bootstrap, EndpointOptions, LogPublisher, SipEndpoint, StartupCoordinator};
//! use std::sync::Arc;
//!
//! let bootstrap = Bootstrap::builder(StartupCoordinator::new()).build();
//! bootstrap.start(tokio::runtime::Handle::current());
//!
//! let options = EndpointOptions::new("defaultSipEndpoint", "0.0.0.0")
//!     .with_tcp_port(5060)
//!     .with_udp_port(5060);
//!
//! let endpoint = SipEndpoint::new("sip", options, bootstrap.clone(), factory, Arc::new(LogPublisher))?;
//! endpoint.update().await?;
//!
//! // binds both listeners
//! bootstrap.signal_started();
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod bridge;
pub mod buffer;
mod chain;
mod channel;
pub mod codec;
mod config;
mod endpoint;
mod error;
pub mod events;
mod listening;
mod listening_point;
mod resolver;
mod startup;

pub use bootstrap::{Bootstrap, BootstrapBuilder, ChainListener, ListenerHandle};
pub use bridge::{ConnectionLink, InboundChannel, InboundChannelFactory};
pub use buffer::{BufferPool, MessageBuffer};
pub use chain::{
    ActiveConfiguration, Chain, ChainContext, ChainKind, ChainNames, ChainOwner, ChainState,
};
pub use channel::{Channel, ChannelId};
pub use config::{BootstrapConfig, EndpointOptions, Options, RetryPolicy};
pub use endpoint::SipEndpoint;
pub use error::{Error, Result};
pub use events::{EventProperties, EventPublisher, LogPublisher};
pub use listening::{ConnectionKey, Direction, Dispatcher, ListeningConnection, SipConnection};
pub use listening_point::{
    ListeningPoint, Transport, UnknownTransport, normalize_host, select_listening_point,
};
pub use resolver::HostResolver;
pub use startup::{RunOutcome, StartupCoordinator};
