use parking_lot::RwLock;
use sip_transport::events::{
    ENDPOINT_ACTIVE_HOST, ENDPOINT_ACTIVE_PORT, ENDPOINT_CONFIG_PORT, ENDPOINT_EXCEPTION,
    ENDPOINT_IS_TLS,
};
use sip_transport::{
    Bootstrap, BootstrapConfig, Chain, ChainContext, ChainKind, ChainOwner, ChainState,
    EndpointOptions, Error, Options, RetryPolicy, SipEndpoint, Transport,
};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Waker};
use support::{RecordingFactory, RecordingPublisher, bootstrap, eventually, events_with_suffix};

mod support;

const TOPIC: &str = "test/endpoint/";

struct Owner {
    endpoint: RwLock<EndpointOptions>,
    tcp: RwLock<Options>,
    tls: RwLock<Option<Options>>,
}

impl Owner {
    fn new(endpoint: EndpointOptions) -> Arc<Self> {
        Arc::new(Self {
            endpoint: RwLock::new(endpoint),
            tcp: RwLock::default(),
            tls: RwLock::default(),
        })
    }
}

impl ChainOwner for Owner {
    fn event_topic(&self) -> String {
        TOPIC.into()
    }

    fn endpoint_options(&self) -> EndpointOptions {
        self.endpoint.read().clone()
    }

    fn tcp_options(&self) -> Options {
        self.tcp.read().clone()
    }

    fn udp_options(&self) -> Options {
        Options::new()
    }

    fn tls_options(&self) -> Option<Options> {
        self.tls.read().clone()
    }
}

struct Harness {
    bootstrap: Bootstrap,
    owner: Arc<Owner>,
    factory: Arc<RecordingFactory>,
    events: Arc<RecordingPublisher>,
}

impl Harness {
    fn new(config: BootstrapConfig, endpoint: EndpointOptions) -> Self {
        let bootstrap = bootstrap(config);

        Self {
            factory: RecordingFactory::new(&bootstrap),
            owner: Owner::new(endpoint),
            events: Arc::new(RecordingPublisher::default()),
            bootstrap,
        }
    }

    fn chain(&self, kind: ChainKind) -> Arc<Chain> {
        Chain::new(
            kind,
            ChainContext {
                owner: self.owner.clone(),
                bootstrap: self.bootstrap.clone(),
                factory: self.factory.clone(),
                events: self.events.clone(),
            },
        )
    }

    fn started_chain(&self, kind: ChainKind) -> Arc<Chain> {
        let chain = self.chain(kind);
        chain.init("ep1", "sip").unwrap();
        chain.enable();
        chain
    }

    fn started(&self) -> usize {
        events_with_suffix(&self.events, "STARTED")
    }

    fn failed(&self) -> usize {
        events_with_suffix(&self.events, "FAILED")
    }

    async fn wait_started(&self, count: usize) {
        eventually("STARTED event", || self.started() >= count).await;
    }
}

fn tcp_endpoint(port: u16) -> EndpointOptions {
    EndpointOptions::new("ep1", "127.0.0.1").with_tcp_port(port)
}

#[tokio::test]
async fn unchanged_update_keeps_running_channels() {
    support::init_logging();
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    chain.update().await.unwrap();
    chain.update().await.unwrap();

    assert_eq!(harness.factory.creations(), 1);
    assert_eq!(harness.started(), 1);
    assert_eq!(chain.state(), ChainState::Started);

    let events = harness.events.events();
    let (topic, properties) = &events[0];
    let port = chain.active_port();

    assert_eq!(topic, "test/endpoint/STARTED");
    assert!(port > 0);
    assert_eq!(properties[ENDPOINT_ACTIVE_PORT], port.to_string());
    assert_eq!(properties[ENDPOINT_ACTIVE_HOST], "127.0.0.1");
    assert_eq!(properties[ENDPOINT_CONFIG_PORT], "0");
    assert_eq!(properties[ENDPOINT_IS_TLS], "false");
}

#[tokio::test]
async fn changed_options_tear_down_before_recreating() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    harness
        .owner
        .tcp
        .write()
        .insert("inactivityTimeout".into(), "60s".into());

    chain.update().await.unwrap();
    harness.wait_started(2).await;

    let created = harness.factory.created.lock();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|creation| creation.registered == 0));
    assert!(!Arc::ptr_eq(&created[0].point, &created[1].point));
    assert_eq!(created[1].transport_name, "TCP_sip_ep1");

    assert_eq!(harness.bootstrap.listening_points().len(), 1);

    let config = chain.current_config().unwrap();
    assert_eq!(config.transport_properties()["inactivityTimeout"], "60s");
}

#[tokio::test]
async fn removing_the_port_stops_the_chain() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    harness.owner.endpoint.write().tcp_port = None;

    chain.update().await.unwrap();
    chain.update().await.unwrap();

    assert_eq!(harness.failed(), 1);
    assert!(harness.bootstrap.listening_points().is_empty());
    assert_eq!(chain.active_port(), -1);

    let events = harness.events.events();
    let (topic, properties) = events.last().unwrap();

    assert_eq!(topic, "test/endpoint/FAILED");
    assert_eq!(properties[ENDPOINT_EXCEPTION], "no port configured");
    assert_eq!(properties[ENDPOINT_CONFIG_PORT], "-1");
}

#[tokio::test]
async fn binding_waits_for_the_startup_signal() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(harness.started(), 0);
    assert_eq!(chain.state(), ChainState::Initialized);
    assert_eq!(harness.bootstrap.listening_points().len(), 1);

    harness.bootstrap.signal_started();
    harness.wait_started(1).await;

    assert_eq!(chain.state(), ChainState::Started);
}

#[tokio::test]
async fn lifecycle_errors() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    let chain = harness.chain(ChainKind::Udp);

    assert_eq!(chain.state(), ChainState::Uninitialized);
    assert!(matches!(chain.update().await, Err(Error::NotInitialized)));

    chain.init("ep1", "sip").unwrap();
    assert!(matches!(
        chain.init("ep1", "sip"),
        Err(Error::AlreadyInitialized)
    ));

    assert_eq!(chain.chain_name(), Some("Chainep1_0"));

    // disabled chains ignore updates
    chain.update().await.unwrap();
    assert_eq!(harness.factory.creations(), 0);
    assert!(harness.events.events().is_empty());

    chain.destroy().await;
    chain.enable();

    assert!(!chain.is_enabled());
    assert_eq!(chain.state(), ChainState::Destroyed);
    assert!(matches!(chain.update().await, Err(Error::Destroyed)));
}

#[tokio::test]
async fn stop_closes_the_listener() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    let port = u16::try_from(chain.active_port()).unwrap();

    chain.stop().await;

    assert_eq!(chain.state(), ChainState::Stopped);
    assert!(harness.bootstrap.listening_points().is_empty());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn stop_passes_through_quiesced() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    // the listener task cannot exit before this task yields
    let mut stop = pin!(chain.stop());
    let mut cx = Context::from_waker(Waker::noop());

    assert!(stop.as_mut().poll(&mut cx).is_pending());
    assert_eq!(chain.state(), ChainState::Quiesced);

    stop.await;

    assert_eq!(chain.state(), ChainState::Stopped);
    assert_eq!(chain.active_port(), -1);
}

#[tokio::test]
async fn destroying_a_started_chain_releases_its_port() {
    let harness = Harness::new(BootstrapConfig::default(), tcp_endpoint(0));
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    let port = u16::try_from(chain.active_port()).unwrap();

    chain.destroy().await;

    assert_eq!(chain.state(), ChainState::Destroyed);
    assert!(harness.bootstrap.listening_points().is_empty());
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());

    chain.enable();

    assert!(!chain.is_enabled());
    assert!(matches!(chain.update().await, Err(Error::Destroyed)));
    assert_eq!(harness.factory.creations(), 1);

    // the port is free for a new listener
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[tokio::test]
async fn failed_startup_is_retried_on_next_update() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let harness = Harness::new(
        BootstrapConfig::default().with_bind_retry(RetryPolicy::none()),
        tcp_endpoint(port),
    );
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tcp);

    chain.update().await.unwrap();
    eventually("FAILED event", || harness.failed() == 1).await;

    let events = harness.events.events();
    assert!(events[0].1.contains_key(ENDPOINT_EXCEPTION));

    drop(occupied);

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    assert_eq!(harness.factory.creations(), 2);
    assert_eq!(chain.active_port(), i32::from(port));
}

#[tokio::test]
async fn tls_chain_waits_for_material() {
    let harness = Harness::new(
        BootstrapConfig::default(),
        EndpointOptions::new("ep1", "127.0.0.1").with_tls_port(0),
    );
    harness.bootstrap.signal_started();

    let chain = harness.started_chain(ChainKind::Tls);

    chain.update().await.unwrap();

    assert_eq!(harness.failed(), 1);
    assert_eq!(harness.factory.creations(), 0);
    assert_eq!(
        harness.events.events()[0].1[ENDPOINT_EXCEPTION],
        "TLS options are not available"
    );

    *harness.owner.tls.write() = Some(Options::from([(
        "keyStoreRef".to_owned(),
        "defaultKeyStore".to_owned(),
    )]));

    chain.update().await.unwrap();
    harness.wait_started(1).await;

    let events = harness.events.events();
    let (_, properties) = events.last().unwrap();

    assert_eq!(properties[ENDPOINT_IS_TLS], "true");
    assert_eq!(
        chain.current_config().unwrap().channel_list(),
        [
            "TCP-ssl_sip_ep1",
            "TLS-TCP-ssl_sip_ep1",
            "SIPChannel_TCP-ssl_sip_ep1_ep1_0"
        ]
    );
}

#[tokio::test]
async fn endpoint_updates_all_chains() {
    let bootstrap = bootstrap(BootstrapConfig::default());
    let factory = RecordingFactory::new(&bootstrap);
    let events = Arc::new(RecordingPublisher::default());

    let options = EndpointOptions::new("defaultSipEndpoint", "127.0.0.1")
        .with_tcp_port(0)
        .with_udp_port(0);

    let endpoint = SipEndpoint::new(
        "sip",
        options,
        bootstrap.clone(),
        factory.clone(),
        events.clone(),
    )
    .unwrap();

    assert!(!endpoint.tls_chain().is_enabled());

    endpoint.update().await.unwrap();
    bootstrap.signal_started();

    eventually("both chains started", || {
        events_with_suffix(&events, "STARTED") == 2
    })
    .await;

    let transports: Vec<Transport> = bootstrap
        .listening_points()
        .iter()
        .map(|point| point.transport())
        .collect();

    assert_eq!(transports.len(), 2);
    assert!(transports.contains(&Transport::Tcp));
    assert!(transports.contains(&Transport::Udp));

    // the TLS chain stays disabled, no event for it
    assert_eq!(events.events().len(), 2);
    assert!(
        events
            .events()
            .iter()
            .all(|(topic, _)| topic.starts_with("sip/endpoint/"))
    );

    endpoint.destroy().await;

    assert!(bootstrap.listening_points().is_empty());
    assert_eq!(endpoint.udp_chain().state(), ChainState::Destroyed);
}
