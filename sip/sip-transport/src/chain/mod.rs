//! Lifecycle of the transport chains of an endpoint
//!
//! A [`Chain`] realizes one listening point of an endpoint (TCP, TLS or UDP). Configuration
//! management calls [`Chain::update`] whenever the endpoint settings change. The chain
//! compares the new settings with the running ones and only rebuilds its channels if
//! something changed. Channels are never patched, a change always means tear down and
//! create again.

use crate::bootstrap::{Bootstrap, ChainListener, ListenerHandle};
use crate::bridge::InboundChannelFactory;
use crate::config::{EndpointOptions, Options};
use crate::error::{Error, Result};
use crate::events::{
    ENDPOINT_EXCEPTION, ENDPOINT_FAILED, ENDPOINT_IS_TLS, ENDPOINT_STARTED, EventPublisher,
};
use crate::listening_point::{ListeningPoint, Transport};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex;

mod config;

pub use config::ActiveConfiguration;

/// Settings source of a chain, usually the endpoint owning it
pub trait ChainOwner: Send + Sync {
    /// Prefix of the topics events are published on
    fn event_topic(&self) -> String;
    fn endpoint_options(&self) -> EndpointOptions;
    fn tcp_options(&self) -> Options;
    fn udp_options(&self) -> Options;
    /// TLS material, `None` while it is not available
    fn tls_options(&self) -> Option<Options>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    Tcp,
    Tls,
    Udp,
}

impl ChainKind {
    pub fn transport(&self) -> Transport {
        match self {
            ChainKind::Tcp | ChainKind::Tls => Transport::Tcp,
            ChainKind::Udp => Transport::Udp,
        }
    }

    pub fn protocol_type(&self) -> &'static str {
        match self {
            ChainKind::Tcp => "tcp",
            ChainKind::Tls => "tls",
            ChainKind::Udp => "udp",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ChainKind::Tls)
    }

    fn name_root(&self) -> &'static str {
        match self {
            ChainKind::Tcp => "TCP",
            ChainKind::Tls => "TCP-ssl",
            ChainKind::Udp => "UDP",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Uninitialized,
    Initialized,
    Started,
    /// Listener is closing, established connections drain
    Quiesced,
    Stopped,
    /// Terminal, the chain cannot be used anymore
    Destroyed,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainState::Uninitialized => "UNINITIALIZED",
            ChainState::Initialized => "INITIALIZED",
            ChainState::Started => "STARTED",
            ChainState::Quiesced => "QUIESCED",
            ChainState::Stopped => "STOPPED",
            ChainState::Destroyed => "DESTROYED",
        };

        f.write_str(name)
    }
}

/// Names of a chain and its channels, generated once by [`Chain::init`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNames {
    endpoint: String,
    transport: String,
    tls: Option<String>,
    sip: String,
    chain: String,
}

impl ChainNames {
    pub fn new(kind: ChainKind, endpoint_id: &str, name: &str, number: u64) -> Self {
        let transport = format!("{}_{name}_{endpoint_id}", kind.name_root());
        let tls = kind.is_tls().then(|| format!("TLS-{transport}"));
        let sip = format!("SIPChannel_{transport}_{endpoint_id}_{number}");

        Self {
            endpoint: endpoint_id.into(),
            transport,
            tls,
            sip,
            chain: format!("Chain{endpoint_id}_{number}"),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn tls(&self) -> Option<&str> {
        self.tls.as_deref()
    }

    pub fn sip(&self) -> &str {
        &self.sip
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Channel names in pipeline order: transport, TLS (if any), SIP
    pub fn channel_list(&self) -> impl Iterator<Item = &str> {
        [Some(self.transport()), self.tls(), Some(self.sip())]
            .into_iter()
            .flatten()
    }
}

/// The settings a chain needs from its surroundings
#[derive(Clone)]
pub struct ChainContext {
    pub owner: Arc<dyn ChainOwner>,
    pub bootstrap: Bootstrap,
    pub factory: Arc<dyn InboundChannelFactory>,
    pub events: Arc<dyn EventPublisher>,
}

struct Channels {
    point: Arc<ListeningPoint>,
    listener: Option<ListenerHandle>,
    failed: bool,
}

impl Channels {
    /// Bound and listening, or waiting for the bind
    fn is_running(&self) -> bool {
        !self.failed
            && self
                .listener
                .as_ref()
                .is_none_or(|listener| !listener.is_closed())
    }
}

pub struct Chain {
    kind: ChainKind,
    context: ChainContext,

    names: OnceLock<ChainNames>,
    enabled: AtomicBool,
    state: SyncMutex<ChainState>,
    current: RwLock<Option<Arc<ActiveConfiguration>>>,

    /// Serializes update, start notifications and teardown
    channels: Mutex<Option<Channels>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("kind", &self.kind)
            .field("names", &self.names.get())
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .field("config", &self.current_config())
            .finish()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chain[kind={},enabled={},state={},chainName={},config=",
            self.kind,
            self.is_enabled(),
            self.state(),
            self.chain_name().unwrap_or("-"),
        )?;

        match self.current_config() {
            Some(config) => write!(f, "{config}]"),
            None => f.write_str("-]"),
        }
    }
}

impl Chain {
    pub fn new(kind: ChainKind, context: ChainContext) -> Arc<Self> {
        Arc::new(Self {
            kind,
            context,
            names: OnceLock::new(),
            enabled: AtomicBool::new(false),
            state: SyncMutex::new(ChainState::Uninitialized),
            current: RwLock::new(None),
            channels: Mutex::new(None),
        })
    }

    /// Generate the names of the chain. Must be called exactly once.
    pub fn init(&self, endpoint_id: &str, name: &str) -> Result<()> {
        if self.names.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let number = self.context.bootstrap.coordinator().next_chain_number();
        let names = ChainNames::new(self.kind, endpoint_id, name, number);

        self.names
            .set(names)
            .map_err(|_| Error::AlreadyInitialized)?;

        self.set_state(ChainState::Initialized);

        Ok(())
    }

    /// Allow updates to start the chain. Does not change the state.
    pub fn enable(&self) {
        if self.state() == ChainState::Destroyed {
            log::debug!("cannot enable destroyed chain {self}");
            return;
        }

        log::debug!("enable chain {self}");
        self.enabled.store(true, Ordering::Release);
    }

    /// Make updates no-ops. Does not change the state.
    pub fn disable(&self) {
        log::debug!("disable chain {self}");
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn transport(&self) -> Transport {
        self.kind.transport()
    }

    pub fn state(&self) -> ChainState {
        *self.state.lock()
    }

    pub fn names(&self) -> Option<&ChainNames> {
        self.names.get()
    }

    pub fn chain_name(&self) -> Option<&str> {
        self.names.get().map(ChainNames::chain)
    }

    pub fn current_config(&self) -> Option<Arc<ActiveConfiguration>> {
        self.current.read().clone()
    }

    /// Bound port or -1
    pub fn active_port(&self) -> i32 {
        self.current_config()
            .map_or(-1, |config| config.active_port())
    }

    pub fn active_host(&self) -> Option<String> {
        self.current_config()?.active_host().map(String::from)
    }

    /// Bring the chain in line with the current options of its owner.
    ///
    /// No-op while disabled or while the host is stopping. Unchanged settings of a running
    /// chain are left alone, otherwise the channels are torn down and created again.
    #[tracing::instrument(level = "debug", skip(self), fields(chain = self.chain_name()))]
    pub async fn update(self: &Arc<Self>) -> Result<()> {
        let mut channels = self.channels.lock().await;

        log::trace!("update chain {self}");

        if self.state() == ChainState::Destroyed {
            return Err(Error::Destroyed);
        }

        let names = self.names.get().ok_or(Error::NotInitialized)?;

        if !self.is_enabled() || self.context.bootstrap.coordinator().is_stopping() {
            return Ok(());
        }

        let old = self.current_config();
        let new = ActiveConfiguration::build(self.kind, &*self.context.owner);

        if let Some(problem) = new.problem() {
            log::debug!("Stopping chain due to configuration {new}, {problem}");

            self.teardown(&mut channels).await;

            let reported = old
                .as_ref()
                .is_some_and(|old| !old.is_complete() && old.unchanged(&new));

            let new = Arc::new(new);
            self.set_config(new.clone());

            if !reported {
                self.post_event(ENDPOINT_FAILED, &new, Some(problem.into()));
            }

            return Ok(());
        }

        match &old {
            Some(old) if old.is_valid() && new.unchanged(old) => {
                if channels.as_ref().is_some_and(Channels::is_running) {
                    log::debug!("Chain is already started {old}");
                    return Ok(());
                }

                log::debug!("Existing config must be started {new}");
            }
            _ => log::debug!("New/changed chain configuration {new}"),
        }

        self.teardown(&mut channels).await;

        let Ok(port) = u16::try_from(new.config_port()) else {
            return Ok(());
        };

        let new = Arc::new(new.with_channels(names));
        let point = Arc::new(ListeningPoint::new(
            new.config_host(),
            port,
            self.kind.transport(),
        ));

        let inbound = self.context.factory.create(&point, names);

        self.set_config(new);

        let listener: Weak<Chain> = Arc::downgrade(self);
        let listener: Weak<dyn ChainListener> = listener;

        self.context
            .bootstrap
            .register_chain(point.clone(), inbound, listener)?;

        *channels = Some(Channels {
            point,
            listener: None,
            failed: false,
        });

        Ok(())
    }

    /// Close the listener. The state moves through QUIESCED while the listener closes to
    /// STOPPED.
    pub async fn stop(&self) {
        let mut channels = self.channels.lock().await;

        if channels.is_none() {
            return;
        }

        if self.state() == ChainState::Started {
            self.set_state(ChainState::Quiesced);
        }

        self.teardown(&mut channels).await;
        self.set_state(ChainState::Stopped);

        log::debug!("stopped chain {self}");
    }

    /// Stop and disable the chain for good
    pub async fn destroy(&self) {
        let mut channels = self.channels.lock().await;

        self.teardown(&mut channels).await;
        self.enabled.store(false, Ordering::Release);
        self.set_state(ChainState::Destroyed);

        log::debug!("destroyed chain {self}");
    }

    async fn teardown(&self, channels: &mut Option<Channels>) {
        let Some(old) = channels.take() else {
            return;
        };

        log::debug!("tearing down channels of {}", old.point);

        self.context.bootstrap.unregister_chain(&old.point).await;

        if let Some(config) = self.current_config() {
            self.set_config(Arc::new(config.with_active(None, None)));
        }
    }

    fn set_state(&self, state: ChainState) {
        *self.state.lock() = state;
    }

    fn set_config(&self, config: Arc<ActiveConfiguration>) {
        *self.current.write() = Some(config);
    }

    fn post_event(&self, suffix: &str, config: &ActiveConfiguration, exception: Option<String>) {
        let topic = format!("{}{suffix}", self.context.owner.event_topic());

        let mut properties = config.event_properties();

        if matches!(self.kind, ChainKind::Tcp | ChainKind::Tls) {
            properties.insert(ENDPOINT_IS_TLS, self.kind.is_tls().to_string());
        }

        if let Some(exception) = exception {
            properties.insert(ENDPOINT_EXCEPTION, exception);
        }

        self.context.events.post_event(&topic, properties);
    }
}

#[async_trait::async_trait]
impl ChainListener for Chain {
    async fn on_chain_started(&self, listener: &ListenerHandle) {
        let mut channels = self.channels.lock().await;

        let Some(current) = channels
            .as_mut()
            .filter(|channels| Arc::ptr_eq(&channels.point, listener.listening_point()))
        else {
            log::debug!("ignoring start of replaced listener {:?}", listener);
            return;
        };

        current.listener = Some(listener.clone());
        self.set_state(ChainState::Started);

        let Some(config) = self.current_config() else {
            return;
        };

        let local = listener.local_addr();
        let config = Arc::new(config.with_active(Some(local.ip().to_string()), Some(local.port())));
        self.set_config(config.clone());

        log::info!("Chain {} is started on {local}", self.chain_name().unwrap_or("-"));

        if config.active_port() > 0 {
            self.post_event(ENDPOINT_STARTED, &config, None);
        }
    }

    async fn on_startup_error(&self, point: &Arc<ListeningPoint>, error: &Error) {
        let mut channels = self.channels.lock().await;

        let Some(current) = channels
            .as_mut()
            .filter(|channels| Arc::ptr_eq(&channels.point, point))
        else {
            return;
        };

        current.failed = true;

        log::debug!("Error starting chain {self}, {error}");

        if let Some(config) = self.current_config() {
            self.post_event(ENDPOINT_FAILED, &config, Some(error.to_string()));
        }
    }
}
