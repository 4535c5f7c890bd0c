//! Association of live channels with the SIP layer
//!
//! Every channel created by a listener passes its events through the [`ConnectionBridge`].
//! On activation the bridge resolves the listening point the channel belongs to and asks the
//! point's [`InboundChannel`] for a [`ConnectionLink`]. Reads are forwarded to that link,
//! close and error events destroy it.

use crate::bootstrap::Registration;
use crate::buffer::MessageBuffer;
use crate::channel::Channel;
use crate::chain::ChainNames;
use crate::codec::DatagramMessage;
use crate::listening_point::{ListeningPoint, ListeningPoints, Transport};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// SIP-layer object bound to exactly one live channel.
///
/// It receives the raw fragments (stream) or datagrams read from the channel and is
/// responsible for finding message boundaries and dispatching complete messages.
pub trait ConnectionLink: Send + Sync {
    /// Deliver a buffer read from the channel. `sender` is only set for datagrams.
    fn receive(&self, buffer: MessageBuffer, sender: Option<SocketAddr>);

    /// The channel is gone. Called at most once per link, `error` is set if the channel
    /// terminated because of a transport error.
    fn close(&self, error: Option<&io::Error>);
}

/// Inbound side of a chain for one listening point
pub trait InboundChannel: Send + Sync {
    /// Return the link for a newly activated channel.
    ///
    /// Stream transports usually create a new link per channel. A datagram transport has
    /// a single channel per socket and may hand out a shared link.
    fn connection_link(&self, channel: &Arc<Channel>) -> Arc<dyn ConnectionLink>;
}

/// Creates the [`InboundChannel`] of a chain whenever its channels are (re)built
pub trait InboundChannelFactory: Send + Sync {
    fn create(&self, point: &Arc<ListeningPoint>, names: &ChainNames) -> Arc<dyn InboundChannel>;
}

/// Routes the events of all channels to their connection links
#[derive(Clone)]
pub(crate) struct ConnectionBridge {
    registry: Arc<ListeningPoints<Registration>>,
}

impl ConnectionBridge {
    pub(crate) fn new(registry: Arc<ListeningPoints<Registration>>) -> Self {
        Self { registry }
    }

    /// Find the registration serving a connection on the local address `local`
    pub(crate) fn find_listening_point(
        &self,
        local: SocketAddr,
        transport: Transport,
    ) -> Option<Arc<Registration>> {
        self.registry.find(local, transport)
    }

    pub(crate) fn channel_active(&self, channel: &Arc<Channel>) {
        let Some(registration) =
            self.find_listening_point(channel.local_addr(), channel.transport())
        else {
            log::debug!("no listening point for {channel}, channel stays unassociated");
            return;
        };

        if channel.link().is_some() {
            log::trace!("{channel} is already linked");
            return;
        }

        let link = registration.inbound().connection_link(channel);

        if channel.attach_link(link) {
            log::trace!("linked {channel} to {}", registration.point());
        } else {
            log::trace!("{channel} was linked concurrently");
        }
    }

    /// Forward a fragment read from a stream channel
    pub(crate) fn channel_read(&self, channel: &Channel, buffer: MessageBuffer) {
        self.forward(channel, buffer, None);
    }

    /// Forward a datagram together with its sender
    pub(crate) fn datagram_read(&self, channel: &Channel, message: DatagramMessage) {
        self.forward(channel, message.buffer, Some(message.sender));
    }

    fn forward(&self, channel: &Channel, buffer: MessageBuffer, sender: Option<SocketAddr>) {
        match channel.link() {
            Some(link) => link.receive(buffer, sender),
            None => log::debug!(
                "dropping {} bytes read on unassociated {channel}",
                buffer.marked_len()
            ),
        }
    }

    pub(crate) fn channel_inactive(&self, channel: &Channel) {
        match channel.release_link() {
            Some(link) => {
                log::trace!("{channel} closed");
                link.close(None);
            }
            None => log::debug!("no link to close for {channel}"),
        }
    }

    pub(crate) fn exception_caught(&self, channel: &Channel, error: io::Error) {
        log::warn!("transport error on {channel}, {error}");

        match channel.release_link() {
            Some(link) => link.close(Some(&error)),
            None => log::debug!("error on unassociated {channel}"),
        }

        channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        created: AtomicUsize,
        received: Mutex<Vec<(Vec<u8>, Option<SocketAddr>)>>,
        closed: Mutex<Vec<Option<io::ErrorKind>>>,
    }

    struct Link(Arc<Recorder>);

    impl ConnectionLink for Link {
        fn receive(&self, buffer: MessageBuffer, sender: Option<SocketAddr>) {
            self.0.received.lock().push((buffer.bytes().to_vec(), sender));
        }

        fn close(&self, error: Option<&io::Error>) {
            self.0.closed.lock().push(error.map(io::Error::kind));
        }
    }

    impl InboundChannel for Arc<Recorder> {
        fn connection_link(&self, _: &Arc<Channel>) -> Arc<dyn ConnectionLink> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(Link(self.clone()))
        }
    }

    fn bridge_with_point(host: &str, port: u16) -> (ConnectionBridge, Arc<Recorder>) {
        bridge_with(host, port, Transport::Tcp)
    }

    fn bridge_with(
        host: &str,
        port: u16,
        transport: Transport,
    ) -> (ConnectionBridge, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let registry = Arc::new(ListeningPoints::default());

        registry.insert(Arc::new(Registration::detached(
            Arc::new(ListeningPoint::new(host, port, transport)),
            Arc::new(recorder.clone()),
        )));

        (ConnectionBridge::new(registry), recorder)
    }

    fn buffer(bytes: &[u8]) -> MessageBuffer {
        MessageBuffer::unpooled(bytes)
    }

    #[test]
    fn link_lives_from_activation_to_close() {
        let (bridge, recorder) = bridge_with_point("127.0.0.1", 5060);
        let channel = Arc::new(Channel::detached(
            1,
            Transport::Tcp,
            "127.0.0.1:5060".parse().unwrap(),
            Some("127.0.0.1:40000".parse().unwrap()),
        ));

        bridge.channel_active(&channel);
        bridge.channel_active(&channel);
        bridge.channel_read(&channel, buffer(b"INVITE "));
        bridge.channel_read(&channel, buffer(b"sip:bob@example.com"));
        bridge.channel_inactive(&channel);
        bridge.channel_inactive(&channel);

        assert_eq!(recorder.created.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.received.lock().len(), 2);
        assert_eq!(*recorder.closed.lock(), vec![None]);
    }

    #[test]
    fn error_destroys_link_once_and_closes_channel() {
        let (bridge, recorder) = bridge_with_point("0.0.0.0", 5060);
        let channel = Arc::new(Channel::detached(
            2,
            Transport::Tcp,
            "10.1.1.1:5060".parse().unwrap(),
            Some("10.1.1.2:40000".parse().unwrap()),
        ));

        bridge.channel_active(&channel);
        bridge.exception_caught(&channel, io::ErrorKind::ConnectionReset.into());
        bridge.channel_inactive(&channel);

        assert!(channel.is_closed());
        assert_eq!(
            *recorder.closed.lock(),
            vec![Some(io::ErrorKind::ConnectionReset)]
        );
    }

    #[test]
    fn unassociated_channel_drops_events() {
        let (bridge, recorder) = bridge_with_point("127.0.0.1", 5060);
        let channel = Arc::new(Channel::detached(
            3,
            Transport::Tcp,
            "127.0.0.1:5070".parse().unwrap(),
            Some("127.0.0.1:40000".parse().unwrap()),
        ));

        bridge.channel_active(&channel);
        bridge.channel_read(&channel, buffer(b"lost"));
        bridge.channel_inactive(&channel);

        assert_eq!(recorder.created.load(Ordering::SeqCst), 0);
        assert!(recorder.received.lock().is_empty());
        assert!(recorder.closed.lock().is_empty());
    }

    #[test]
    fn datagrams_carry_their_sender() {
        let (bridge, recorder) = bridge_with("127.0.0.1", 5060, Transport::Udp);
        let channel = Arc::new(Channel::detached(
            4,
            Transport::Udp,
            "127.0.0.1:5060".parse().unwrap(),
            None,
        ));
        let sender: SocketAddr = "192.0.2.7:5062".parse().unwrap();

        bridge.channel_active(&channel);
        bridge.datagram_read(
            &channel,
            DatagramMessage {
                buffer: buffer(b"OPTIONS sip:alice@example.com SIP/2.0"),
                sender,
            },
        );

        let received = recorder.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, Some(sender));
    }
}
