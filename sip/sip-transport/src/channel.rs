use crate::bridge::ConnectionLink;
use crate::buffer::MessageBuffer;
use crate::codec::MessageEncoder;
use crate::listening_point::Transport;
use bytes::BytesMut;
use parking_lot::Mutex as SyncMutex;
use std::mem::replace;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Process unique id of a [`Channel`]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live network connection: an accepted TCP stream or a bound UDP socket.
///
/// The channel is also the connection context: it carries the [`ConnectionLink`] the
/// connection was associated with. The link is attached at most once and released exactly
/// once, whichever of close or error comes first.
pub struct Channel {
    id: ChannelId,
    transport: Transport,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    writer: Writer,

    link: SyncMutex<LinkSlot>,
    close: CancellationToken,
}

/// Released links are dropped from the channel, links usually keep a reference to it
enum LinkSlot {
    Vacant,
    Attached(Arc<dyn ConnectionLink>),
    Released,
}

enum Writer {
    Stream(Mutex<OwnedWriteHalf>),
    Datagram(Arc<UdpSocket>),
    #[cfg(test)]
    Detached,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("linked", &matches!(*self.link.lock(), LinkSlot::Attached(_)))
            .field("closed", &self.close.is_cancelled())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote {
            Some(remote) => write!(
                f,
                "{}{}:local={}:remote={}",
                self.transport, self.id, self.local, remote
            ),
            None => write!(f, "{}{}:local={}", self.transport, self.id, self.local),
        }
    }
}

impl Channel {
    pub(crate) fn stream(
        id: ChannelId,
        local: SocketAddr,
        remote: SocketAddr,
        write: OwnedWriteHalf,
        close: CancellationToken,
    ) -> Self {
        Self::new(
            id,
            Transport::Tcp,
            local,
            Some(remote),
            Writer::Stream(Mutex::new(write)),
            close,
        )
    }

    pub(crate) fn datagram(
        id: ChannelId,
        local: SocketAddr,
        socket: Arc<UdpSocket>,
        close: CancellationToken,
    ) -> Self {
        Self::new(
            id,
            Transport::Udp,
            local,
            None,
            Writer::Datagram(socket),
            close,
        )
    }

    #[cfg(test)]
    pub(crate) fn detached(
        id: u64,
        transport: Transport,
        local: SocketAddr,
        remote: Option<SocketAddr>,
    ) -> Self {
        Self::new(
            ChannelId(id),
            transport,
            local,
            remote,
            Writer::Detached,
            CancellationToken::new(),
        )
    }

    fn new(
        id: ChannelId,
        transport: Transport,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        writer: Writer,
        close: CancellationToken,
    ) -> Self {
        Self {
            id,
            transport,
            local,
            remote,
            writer,
            link: SyncMutex::new(LinkSlot::Vacant),
            close,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Peer of a stream channel, datagram channels have no fixed peer
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Attach `link` to this channel. Returns false if a link was attached before.
    pub(crate) fn attach_link(&self, link: Arc<dyn ConnectionLink>) -> bool {
        let mut slot = self.link.lock();

        match *slot {
            LinkSlot::Vacant => {
                *slot = LinkSlot::Attached(link);
                true
            }
            LinkSlot::Attached(_) | LinkSlot::Released => false,
        }
    }

    /// The attached link, unless it has been released
    pub fn link(&self) -> Option<Arc<dyn ConnectionLink>> {
        match &*self.link.lock() {
            LinkSlot::Attached(link) => Some(link.clone()),
            LinkSlot::Vacant | LinkSlot::Released => None,
        }
    }

    /// Take the link for destruction. Only the first call yields it.
    pub(crate) fn release_link(&self) -> Option<Arc<dyn ConnectionLink>> {
        match replace(&mut *self.link.lock(), LinkSlot::Released) {
            LinkSlot::Attached(link) => Some(link),
            LinkSlot::Vacant | LinkSlot::Released => None,
        }
    }

    /// Request the channel to close. The owning I/O task delivers the close event.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`close`](Channel::close) was called or the owning group shuts down
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }

    /// Encode and write `buffer` to the peer of a stream channel, or to the fixed peer
    /// of a datagram channel.
    pub async fn write(&self, buffer: MessageBuffer) -> io::Result<()> {
        let Some(remote) = self.remote else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram channel requires a target address",
            ));
        };

        self.send_to(buffer, remote).await
    }

    /// Encode and send `buffer`. Stream channels ignore `target`.
    pub async fn send_to(&self, mut buffer: MessageBuffer, target: SocketAddr) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("channel {self} is closed"),
            ));
        }

        let mut out = BytesMut::with_capacity(buffer.marked_len());
        MessageEncoder.encode(&mut buffer, &mut out)?;

        match &self.writer {
            Writer::Stream(write) => {
                let mut write = write.lock().await;
                write.write_all(&out).await
            }
            Writer::Datagram(socket) => socket.send_to(&out, target).await.map(|_| ()),
            #[cfg(test)]
            Writer::Detached => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "detached channel",
            )),
        }
    }

    /// Shut down the write side of a stream channel
    pub(crate) async fn shutdown(&self) {
        if let Writer::Stream(write) = &self.writer {
            if let Err(e) = write.lock().await.shutdown().await {
                log::trace!("failed to shut down {self}, {e}");
            }
        }
    }
}
