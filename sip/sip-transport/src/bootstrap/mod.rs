//! Event loop groups, listener templates and binding of listening points
//!
//! The [`Bootstrap`] owns three groups of tasks sharing one runtime handle:
//! TCP accept loops, TCP connection tasks and UDP socket tasks. Chains register their
//! listening points here, binding is deferred until the host signalled its startup through
//! the [`StartupCoordinator`].

use crate::bridge::{ConnectionBridge, InboundChannel};
use crate::buffer::BufferPool;
use crate::channel::ChannelId;
use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::listening::Dispatcher;
use crate::listening_point::{ListeningPoint, ListeningPoints, Transport};
use crate::resolver::HostResolver;
use crate::startup::StartupCoordinator;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

mod tcp;
mod udp;

/// Receives the outcome of binding a registered listening point
#[async_trait::async_trait]
pub trait ChainListener: Send + Sync {
    /// The listening point was bound, its port reflects the bound port
    async fn on_chain_started(&self, listener: &ListenerHandle);

    /// Binding the listening point failed for good
    async fn on_startup_error(&self, point: &Arc<ListeningPoint>, error: &Error);
}

/// A listening point registered by a chain, together with the inbound channel serving it
pub(crate) struct Registration {
    point: Arc<ListeningPoint>,
    inbound: Arc<dyn InboundChannel>,
    listener: Option<Weak<dyn ChainListener>>,

    claimed: AtomicBool,
    state: Mutex<RegistrationState>,
}

#[derive(Default)]
struct RegistrationState {
    removed: bool,
    handle: Option<ListenerHandle>,
}

impl Registration {
    fn new(
        point: Arc<ListeningPoint>,
        inbound: Arc<dyn InboundChannel>,
        listener: Option<Weak<dyn ChainListener>>,
    ) -> Self {
        Self {
            point,
            inbound,
            listener,
            claimed: AtomicBool::new(false),
            state: Mutex::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(point: Arc<ListeningPoint>, inbound: Arc<dyn InboundChannel>) -> Self {
        Self::new(point, inbound, None)
    }

    pub(crate) fn point(&self) -> &Arc<ListeningPoint> {
        &self.point
    }

    pub(crate) fn inbound(&self) -> &Arc<dyn InboundChannel> {
        &self.inbound
    }

    fn listener(&self) -> Option<Arc<dyn ChainListener>> {
        self.listener.as_ref()?.upgrade()
    }

    /// Claim the right to bind this registration, succeeds once
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Store the handle of the bound listener. A registration removed in the meantime
    /// closes the listener instead.
    fn attach(&self, handle: &ListenerHandle) -> bool {
        let mut state = self.state.lock();

        if state.removed {
            handle.close();
            false
        } else {
            state.handle = Some(handle.clone());
            true
        }
    }

    fn detach(&self) -> Option<ListenerHandle> {
        let mut state = self.state.lock();
        state.removed = true;
        state.handle.take()
    }
}

impl AsRef<ListeningPoint> for Registration {
    fn as_ref(&self) -> &ListeningPoint {
        &self.point
    }
}

/// Handle to a bound listener. Cheap to clone.
///
/// Closing the handle stops accepting (TCP) or receiving (UDP). Connections already
/// accepted stay alive until they close on their own or the bootstrap shuts down.
#[derive(Clone)]
pub struct ListenerHandle {
    point: Arc<ListeningPoint>,
    local: SocketAddr,
    close: CancellationToken,
    finished: CancellationToken,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("point", &self.point)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ListenerHandle {
    fn new(point: Arc<ListeningPoint>, local: SocketAddr, close: CancellationToken) -> Self {
        Self {
            point,
            local,
            close,
            finished: CancellationToken::new(),
        }
    }

    pub fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.point
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the listener task exited and the socket is released
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }
}

/// One group of tasks: shares the runtime, is tracked and shut down as a whole
pub(crate) struct EventLoopGroup {
    name: &'static str,
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl EventLoopGroup {
    fn new(name: &'static str, handle: Handle) -> Self {
        Self {
            name,
            handle,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(future, &self.handle);
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

struct EventLoopGroups {
    tcp_accept: EventLoopGroup,
    tcp_io: EventLoopGroup,
    udp_io: EventLoopGroup,
}

impl EventLoopGroups {
    fn iter(&self) -> impl Iterator<Item = &EventLoopGroup> {
        [&self.tcp_accept, &self.tcp_io, &self.udp_io].into_iter()
    }
}

pub struct BootstrapBuilder {
    config: BootstrapConfig,
    coordinator: StartupCoordinator,
    resolver: Option<HostResolver>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl BootstrapBuilder {
    pub fn config(&mut self, config: BootstrapConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn set_resolver(&mut self, resolver: HostResolver) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    /// Dispatcher notified of every accepted TCP connection
    pub fn set_dispatcher(&mut self, dispatcher: Arc<dyn Dispatcher>) -> &mut Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(&mut self) -> Bootstrap {
        let config = std::mem::take(&mut self.config);
        let registry = Arc::new(ListeningPoints::default());

        Bootstrap {
            inner: Arc::new(Inner {
                pool: BufferPool::new(config.pool_capacity, config.buffer_capacity),
                config,
                coordinator: self.coordinator.clone(),
                resolver: Arc::new(self.resolver.take().unwrap_or_default()),
                dispatcher: self.dispatcher.take(),
                bridge: ConnectionBridge::new(registry.clone()),
                registry,
                groups: OnceLock::new(),
                channel_ids: AtomicU64::new(0),
            }),
        }
    }
}

/// Owner of all listeners and connections of a process. Cheap to clone.
#[derive(Clone)]
pub struct Bootstrap {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    config: BootstrapConfig,
    coordinator: StartupCoordinator,
    resolver: Arc<HostResolver>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    pool: BufferPool,

    registry: Arc<ListeningPoints<Registration>>,
    bridge: ConnectionBridge,

    groups: OnceLock<EventLoopGroups>,
    channel_ids: AtomicU64,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("started", &self.inner.groups.get().is_some())
            .field("coordinator", &self.inner.coordinator)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Bootstrap {
    pub fn builder(coordinator: StartupCoordinator) -> BootstrapBuilder {
        BootstrapBuilder {
            config: BootstrapConfig::default(),
            coordinator,
            resolver: None,
            dispatcher: None,
        }
    }

    /// Create the event loop groups on the runtime of `handle`.
    ///
    /// Returns false if the bootstrap was started before, the first handle stays in use.
    pub fn start(&self, handle: Handle) -> bool {
        let groups = EventLoopGroups {
            tcp_accept: EventLoopGroup::new("tcp-accept", handle.clone()),
            tcp_io: EventLoopGroup::new("tcp-io", handle.clone()),
            udp_io: EventLoopGroup::new("udp-io", handle),
        };

        if self.inner.groups.set(groups).is_err() {
            log::debug!("bootstrap is already started");
            return false;
        }

        log::debug!("bootstrap started");

        true
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &StartupCoordinator {
        &self.inner.coordinator
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Signal that the host is started, binds every registered listening point
    pub fn signal_started(&self) -> bool {
        self.inner.coordinator.signal_started()
    }

    /// Snapshot of all registered listening points in registration order
    pub fn listening_points(&self) -> Vec<Arc<ListeningPoint>> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|registration| registration.point.clone())
            .collect()
    }

    /// Find the listening point a connection with the local address `local` belongs to
    pub fn find_listening_point(
        &self,
        local: SocketAddr,
        transport: Transport,
    ) -> Option<Arc<ListeningPoint>> {
        self.inner
            .bridge
            .find_listening_point(local, transport)
            .map(|registration| registration.point.clone())
    }

    /// Register the listening point of a chain and the inbound channel serving it.
    ///
    /// The point is bound once the host is started, `listener` is told about the outcome.
    pub fn register_chain(
        &self,
        point: Arc<ListeningPoint>,
        inbound: Arc<dyn InboundChannel>,
        listener: Weak<dyn ChainListener>,
    ) -> Result<()> {
        self.inner.groups()?;

        let registration = Arc::new(Registration::new(point, inbound, Some(listener)));
        self.inner.registry.insert(registration.clone());

        log::debug!("registered listening point {}", registration.point);

        let weak = Arc::downgrade(&self.inner);

        let outcome = self.inner.coordinator.run_when_started(move || {
            if let Some(inner) = weak.upgrade() {
                inner.spawn_startup_bind(registration);
            }
        });

        if outcome.is_deferred() {
            log::debug!("binding deferred until the host is started");
        }

        Ok(())
    }

    /// Remove the registration of `point` and wait until its listener is closed
    pub async fn unregister_chain(&self, point: &ListeningPoint) {
        let Some(registration) = self.inner.registry.remove(point) else {
            return;
        };

        if let Some(handle) = registration.detach() {
            handle.close();
            handle.closed().await;
        }

        log::debug!("unregistered listening point {point}");
    }

    /// Bind `point` right away.
    ///
    /// Returns once the socket is bound, the listener keeps running until its handle is
    /// closed. Binding a registered point which is bound by the startup path fails.
    #[tracing::instrument(level = "debug", err, skip(self), fields(point = %point))]
    pub async fn bind(&self, point: &Arc<ListeningPoint>) -> Result<ListenerHandle> {
        let registration = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .find(|registration| Arc::ptr_eq(&registration.point, point));

        let Some(registration) = registration else {
            return self.inner.bind(point).await;
        };

        if !registration.claim() {
            return Err(Error::AlreadyListening);
        }

        let handle = self.inner.bind(point).await?;

        if !registration.attach(&handle) {
            return Err(Error::NotListening);
        }

        Ok(handle)
    }

    /// Stop accepting, close all connections and wait for their tasks, bounded by the
    /// configured shutdown timeout
    pub async fn shutdown(&self) {
        self.inner.coordinator.begin_stopping();

        let Some(groups) = self.inner.groups.get() else {
            return;
        };

        for group in groups.iter() {
            group.tracker.close();
            group.shutdown.cancel();
        }

        let drained = async {
            for group in groups.iter() {
                group.tracker.wait().await;
                log::debug!("{} group drained", group.name);
            }
        };

        if tokio::time::timeout(self.inner.config.shutdown_timeout, drained)
            .await
            .is_err()
        {
            log::warn!(
                "shutdown timed out after {:?}, abandoning remaining tasks",
                self.inner.config.shutdown_timeout
            );
        }
    }
}

impl Inner {
    fn groups(&self) -> Result<&EventLoopGroups> {
        self.groups.get().ok_or(Error::NotStarted)
    }

    pub(crate) fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.channel_ids.fetch_add(1, Ordering::Relaxed))
    }

    async fn bind(self: &Arc<Self>, point: &Arc<ListeningPoint>) -> Result<ListenerHandle> {
        let groups = self.groups()?;

        match point.transport() {
            Transport::Tcp => tcp::bind(self, groups, point.clone()).await,
            Transport::Udp => udp::bind(self, groups, point.clone()).await,
        }
    }

    fn spawn_startup_bind(self: &Arc<Self>, registration: Arc<Registration>) {
        let Ok(groups) = self.groups() else {
            log::error!("cannot bind {}, bootstrap is gone", registration.point);
            return;
        };

        let group = match registration.point.transport() {
            Transport::Tcp => &groups.tcp_accept,
            Transport::Udp => &groups.udp_io,
        };

        let shutdown = group.child_token();
        let inner = self.clone();

        group.spawn(async move {
            tokio::select! {
                _ = inner.startup_bind(&registration) => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    async fn startup_bind(self: &Arc<Self>, registration: &Arc<Registration>) {
        if !registration.claim() {
            log::debug!("{} is already bound", registration.point);
            return;
        }

        let policy = self.config.bind_retry;
        let mut attempt = 0;

        let error = loop {
            if registration.is_removed() {
                return;
            }

            match self.bind(&registration.point).await {
                Ok(handle) => {
                    if !registration.attach(&handle) {
                        log::debug!("{} was unregistered while binding", registration.point);
                        return;
                    }

                    if let Some(listener) = registration.listener() {
                        listener.on_chain_started(&handle).await;
                    }

                    return;
                }
                Err(e) if attempt < policy.attempts && !self.coordinator.is_stopping() => {
                    attempt += 1;

                    let backoff = policy.backoff(attempt);

                    log::debug!(
                        "failed to bind {}, retrying in {backoff:?}, {e}",
                        registration.point
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => break e,
            }
        };

        log::debug!("giving up to bind {}, {error}", registration.point);

        if let Some(listener) = registration.listener() {
            listener.on_startup_error(&registration.point, &error).await;
        }
    }
}
