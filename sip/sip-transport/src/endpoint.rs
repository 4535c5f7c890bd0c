use crate::bootstrap::Bootstrap;
use crate::bridge::InboundChannelFactory;
use crate::chain::{Chain, ChainContext, ChainKind, ChainOwner};
use crate::config::{EndpointOptions, Options};
use crate::error::Result;
use crate::events::EventPublisher;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

const DEFAULT_EVENT_TOPIC: &str = "sip/endpoint/";

/// A SIP endpoint: its settings and the TCP, TLS and UDP chains realizing them.
///
/// Cheap to clone. Settings changes take effect on the next [`update`](SipEndpoint::update).
#[derive(Clone)]
pub struct SipEndpoint {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<EndpointSettings>,
    tcp: Arc<Chain>,
    tls: Arc<Chain>,
    udp: Arc<Chain>,
}

struct EndpointSettings {
    topic: String,
    current: RwLock<Settings>,
}

#[derive(Clone)]
struct Settings {
    endpoint: EndpointOptions,
    tcp: Options,
    udp: Options,
    tls: Option<Options>,
}

impl ChainOwner for EndpointSettings {
    fn event_topic(&self) -> String {
        self.topic.clone()
    }

    fn endpoint_options(&self) -> EndpointOptions {
        self.current.read().endpoint.clone()
    }

    fn tcp_options(&self) -> Options {
        self.current.read().tcp.clone()
    }

    fn udp_options(&self) -> Options {
        self.current.read().udp.clone()
    }

    fn tls_options(&self) -> Option<Options> {
        self.current.read().tls.clone()
    }
}

impl fmt::Debug for SipEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipEndpoint")
            .field("endpoint", &self.inner.settings.endpoint_options())
            .field("tcp", &self.inner.tcp)
            .field("tls", &self.inner.tls)
            .field("udp", &self.inner.udp)
            .finish()
    }
}

impl SipEndpoint {
    /// Create the endpoint and initialize its chains.
    ///
    /// TCP and UDP chains are enabled right away, the TLS chain once TLS options are set.
    pub fn new(
        name: &str,
        options: EndpointOptions,
        bootstrap: Bootstrap,
        factory: Arc<dyn InboundChannelFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        Self::with_topic(name, DEFAULT_EVENT_TOPIC, options, bootstrap, factory, events)
    }

    /// Like [`new`](SipEndpoint::new), publishing events below `topic`
    pub fn with_topic(
        name: &str,
        topic: &str,
        options: EndpointOptions,
        bootstrap: Bootstrap,
        factory: Arc<dyn InboundChannelFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let endpoint_id = options.id.clone();

        let settings = Arc::new(EndpointSettings {
            topic: topic.into(),
            current: RwLock::new(Settings {
                endpoint: options,
                tcp: Options::new(),
                udp: Options::new(),
                tls: None,
            }),
        });

        let context = ChainContext {
            owner: settings.clone(),
            bootstrap,
            factory,
            events,
        };

        let tcp = Chain::new(ChainKind::Tcp, context.clone());
        let tls = Chain::new(ChainKind::Tls, context.clone());
        let udp = Chain::new(ChainKind::Udp, context);

        for chain in [&tcp, &tls, &udp] {
            chain.init(&endpoint_id, name)?;
        }

        tcp.enable();
        udp.enable();

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                tcp,
                tls,
                udp,
            }),
        })
    }

    pub fn options(&self) -> EndpointOptions {
        self.inner.settings.endpoint_options()
    }

    pub fn set_options(&self, options: EndpointOptions) {
        self.inner.settings.current.write().endpoint = options;
    }

    pub fn set_tcp_options(&self, options: Options) {
        self.inner.settings.current.write().tcp = options;
    }

    pub fn set_udp_options(&self, options: Options) {
        self.inner.settings.current.write().udp = options;
    }

    /// Set or remove the TLS material. The TLS chain is enabled once material is present,
    /// removing it stops the chain on the next update.
    pub fn set_tls_options(&self, options: Option<Options>) {
        let available = options.is_some();
        self.inner.settings.current.write().tls = options;

        if available {
            self.inner.tls.enable();
        }
    }

    pub fn tcp_chain(&self) -> &Arc<Chain> {
        &self.inner.tcp
    }

    pub fn tls_chain(&self) -> &Arc<Chain> {
        &self.inner.tls
    }

    pub fn udp_chain(&self) -> &Arc<Chain> {
        &self.inner.udp
    }

    /// Update all chains, independent chains proceed in parallel
    pub async fn update(&self) -> Result<()> {
        let (tcp, tls, udp) = tokio::join!(
            self.inner.tcp.update(),
            self.inner.tls.update(),
            self.inner.udp.update(),
        );

        tcp.and(tls).and(udp)
    }

    pub async fn stop(&self) {
        tokio::join!(
            self.inner.tcp.stop(),
            self.inner.tls.stop(),
            self.inner.udp.stop(),
        );
    }

    pub async fn destroy(&self) {
        tokio::join!(
            self.inner.tcp.destroy(),
            self.inner.tls.destroy(),
            self.inner.udp.destroy(),
        );
    }
}
