#![allow(dead_code, unreachable_pub)]

use parking_lot::Mutex;
use sip_transport::{
    Bootstrap, BootstrapConfig, Channel, ChainListener, ChainNames, ConnectionLink, Error,
    EventProperties, EventPublisher, InboundChannel, InboundChannelFactory, ListenerHandle,
    ListeningPoint, MessageBuffer, StartupCoordinator,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Started bootstrap with its own coordinator, startup not yet signalled
pub fn bootstrap(config: BootstrapConfig) -> Bootstrap {
    let bootstrap = Bootstrap::builder(StartupCoordinator::new())
        .config(config)
        .build();

    assert!(bootstrap.start(Handle::current()));

    bootstrap
}

/// Poll `condition` until it holds, panics after a few seconds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);

    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Everything the connection links of one inbound channel saw
#[derive(Default)]
pub struct Recorded {
    pub links: AtomicUsize,
    pub received: Mutex<Vec<(Vec<u8>, Option<SocketAddr>)>>,
    pub closed: Mutex<Vec<Option<io::ErrorKind>>>,
}

impl Recorded {
    pub fn links(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.received
            .lock()
            .iter()
            .flat_map(|(bytes, _)| bytes.clone())
            .collect()
    }
}

struct RecordingLink(Arc<Recorded>);

impl ConnectionLink for RecordingLink {
    fn receive(&self, buffer: MessageBuffer, sender: Option<SocketAddr>) {
        self.0.received.lock().push((buffer.bytes().to_vec(), sender));
    }

    fn close(&self, error: Option<&io::Error>) {
        self.0.closed.lock().push(error.map(io::Error::kind));
    }
}

pub struct RecordingInbound(pub Arc<Recorded>);

impl InboundChannel for RecordingInbound {
    fn connection_link(&self, _: &Arc<Channel>) -> Arc<dyn ConnectionLink> {
        self.0.links.fetch_add(1, Ordering::SeqCst);
        Arc::new(RecordingLink(self.0.clone()))
    }
}

pub struct Creation {
    pub point: Arc<ListeningPoint>,
    pub transport_name: String,
    /// Listening points registered at the bootstrap when the channel was created
    pub registered: usize,
}

/// Creates recording inbound channels, remembers what was registered at creation time
pub struct RecordingFactory {
    pub bootstrap: Bootstrap,
    pub recorded: Arc<Recorded>,
    pub created: Mutex<Vec<Creation>>,
}

impl RecordingFactory {
    pub fn new(bootstrap: &Bootstrap) -> Arc<Self> {
        Arc::new(Self {
            bootstrap: bootstrap.clone(),
            recorded: Arc::default(),
            created: Mutex::default(),
        })
    }

    pub fn creations(&self) -> usize {
        self.created.lock().len()
    }
}

impl InboundChannelFactory for RecordingFactory {
    fn create(&self, point: &Arc<ListeningPoint>, names: &ChainNames) -> Arc<dyn InboundChannel> {
        self.created.lock().push(Creation {
            point: point.clone(),
            transport_name: names.transport().into(),
            registered: self.bootstrap.listening_points().len(),
        });

        Arc::new(RecordingInbound(self.recorded.clone()))
    }
}

/// Chain listener remembering bind outcomes
#[derive(Default)]
pub struct RecordingListener {
    pub started: Mutex<Vec<SocketAddr>>,
    pub errors: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ChainListener for RecordingListener {
    async fn on_chain_started(&self, listener: &ListenerHandle) {
        self.started.lock().push(listener.local_addr());
    }

    async fn on_startup_error(&self, _: &Arc<ListeningPoint>, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}

/// Publisher keeping every event in memory
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, EventProperties)>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<(String, EventProperties)> {
        self.events.lock().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn post_event(&self, topic: &str, properties: EventProperties) {
        self.events.lock().push((topic.into(), properties));
    }
}

pub fn events_with_suffix(publisher: &RecordingPublisher, suffix: &str) -> usize {
    publisher
        .events()
        .iter()
        .filter(|(topic, _)| topic.ends_with(suffix))
        .count()
}
