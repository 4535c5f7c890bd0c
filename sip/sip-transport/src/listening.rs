//! The bound socket of one TCP listening point

use crate::error::{Error, Result};
use crate::listening_point::{ListeningPoint, Transport, normalize_host};
use crate::resolver::HostResolver;
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, watch};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing key of a connection: transport, normalized host and port of the peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl ConnectionKey {
    pub fn new(transport: Transport, host: &str, port: u16) -> Self {
        Self {
            transport,
            host: normalize_host(host),
            port,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A SIP level connection between a listening point and a peer.
///
/// Creating one never performs I/O, outgoing connections are established with
/// [`SipConnection::connect`].
#[derive(Debug, Clone)]
pub struct SipConnection {
    key: ConnectionKey,
    remote: SocketAddr,
    listening_point: Arc<ListeningPoint>,
    direction: Direction,
    connect_timeout: Duration,
    keep_alive: bool,
}

impl SipConnection {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.listening_point
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect to the remote peer with the connect timeout and keep-alive setting of the
    /// listening connection it was created by
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let socket = match self.remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        socket.set_keepalive(self.keep_alive)?;

        let timeout = self.connect_timeout;

        match tokio::time::timeout(timeout, socket.connect(self.remote)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {timeout:?}", self.remote),
            )),
        }
    }
}

/// Receives connections accepted by a [`ListeningConnection`]. Implemented by the SIP layer.
pub trait Dispatcher: Send + Sync {
    fn queue_connection_accepted(&self, listener: &ListeningConnection, connection: SipConnection);
}

/// Owns the listening socket of one TCP listening point
pub struct ListeningConnection {
    point: Arc<ListeningPoint>,
    resolver: Arc<HostResolver>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    connect_timeout: Duration,
    keep_alive: bool,

    listen_lock: Mutex<()>,
    socket: SyncMutex<Option<Arc<TcpListener>>>,
    listening: watch::Sender<bool>,
}

impl fmt::Debug for ListeningConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListeningConnection")
            .field("point", &self.point)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl ListeningConnection {
    pub fn new(point: Arc<ListeningPoint>, resolver: Arc<HostResolver>) -> Self {
        Self {
            point,
            resolver,
            dispatcher: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: true,
            listen_lock: Mutex::new(()),
            socket: SyncMutex::new(None),
            listening: watch::Sender::new(false),
        }
    }

    /// Notify `dispatcher` of every accepted connection
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Settings of outgoing connections created by [`create_connection`](Self::create_connection)
    pub fn with_connect_options(mut self, timeout: Duration, keep_alive: bool) -> Self {
        self.connect_timeout = timeout;
        self.keep_alive = keep_alive;
        self
    }

    pub fn listening_point(&self) -> &Arc<ListeningPoint> {
        &self.point
    }

    pub fn is_listening(&self) -> bool {
        *self.listening.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.lock().clone()?;
        socket.local_addr().ok()
    }

    /// Resolve the host of the listening point and bind to it.
    ///
    /// A port of 0 lets the OS choose, the chosen port is written back into the listening
    /// point. Returns the bound address.
    #[tracing::instrument(level = "debug", err, skip(self), fields(point = %self.point))]
    pub async fn listen(&self) -> Result<SocketAddr> {
        let _guard = self.listen_lock.lock().await;

        if self.is_listening() {
            return Err(Error::AlreadyListening);
        }

        let ip = self
            .resolver
            .resolve(self.point.host())
            .await
            .map_err(|source| Error::Resolve {
                host: self.point.host().into(),
                source,
            })?;

        let addr = SocketAddr::new(ip, self.point.port());

        let socket = match TcpListener::bind(addr).await {
            Ok(socket) => socket,
            Err(source) => {
                log::error!("Failed to listen on {}, {source}", self.point);
                return Err(Error::Bind { addr, source });
            }
        };

        let bound = socket.local_addr()?;
        self.point.set_port(bound.port());

        *self.socket.lock() = Some(Arc::new(socket));
        self.listening.send_replace(true);

        log::info!("Listening on {} for {}", bound, self.point);

        Ok(bound)
    }

    /// Accept the next connection and notify the dispatcher about it
    pub async fn accept(&self) -> Result<(TcpStream, SipConnection)> {
        let socket = self.socket.lock().clone().ok_or(Error::NotListening)?;
        let mut listening = self.listening.subscribe();

        tokio::select! {
            result = socket.accept() => {
                let (stream, remote) = result?;
                let connection = self.on_connection_accepted(remote);

                Ok((stream, connection))
            }
            _ = listening.wait_for(|listening| !*listening) => Err(Error::NotListening),
        }
    }

    /// Build an outgoing connection from this listening point to `remote_ip:port`
    pub fn create_connection(&self, remote_ip: IpAddr, port: u16) -> SipConnection {
        let remote = SocketAddr::new(remote_ip, port);

        SipConnection {
            key: ConnectionKey::new(self.point.transport(), &remote_ip.to_string(), port),
            remote,
            listening_point: self.point.clone(),
            direction: Direction::Outgoing,
            connect_timeout: self.connect_timeout,
            keep_alive: self.keep_alive,
        }
    }

    /// Build the connection object of an accepted connection and hand it to the dispatcher
    pub fn on_connection_accepted(&self, remote: SocketAddr) -> SipConnection {
        let connection = SipConnection {
            key: ConnectionKey::new(Transport::Tcp, &remote.ip().to_string(), remote.port()),
            remote,
            listening_point: self.point.clone(),
            direction: Direction::Incoming,
            connect_timeout: self.connect_timeout,
            keep_alive: self.keep_alive,
        };

        match &self.dispatcher {
            Some(dispatcher) => dispatcher.queue_connection_accepted(self, connection.clone()),
            None => log::trace!("accepted {} without dispatcher", connection.key),
        }

        connection
    }

    /// Close the listening socket. Established connections are not affected.
    pub fn stop_listen(&self) {
        let socket = self.socket.lock().take();

        if socket.is_some() {
            self.listening.send_replace(false);
            log::info!("Stopped listening for {}", self.point);
        }
    }

    pub fn close(&self) {
        self.stop_listen();
    }

    /// Resolves once the connection is not listening
    pub async fn closed(&self) {
        let mut listening = self.listening.subscribe();
        let _ = listening.wait_for(|listening| !*listening).await;
    }
}
