use super::{EventLoopGroups, Inner, ListenerHandle};
use crate::channel::Channel;
use crate::codec::{DatagramDecoder, DatagramMessage};
use crate::error::{Error, Result};
use crate::listening_point::ListeningPoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_stream::StreamExt;
use tokio_util::udp::UdpFramed;

pub(super) async fn bind(
    inner: &Arc<Inner>,
    groups: &EventLoopGroups,
    point: Arc<ListeningPoint>,
) -> Result<ListenerHandle> {
    let ip = inner
        .resolver
        .resolve(point.host())
        .await
        .map_err(|source| Error::Resolve {
            host: point.host().into(),
            source,
        })?;

    let addr = SocketAddr::new(ip, point.port());

    let socket = match UdpSocket::bind(addr).await {
        Ok(socket) => socket,
        Err(source) => {
            log::error!("Failed to bind UDP for {point}, {source}");
            return Err(Error::Bind { addr, source });
        }
    };

    let local = socket.local_addr()?;
    point.set_port(local.port());

    log::info!("Bound UDP to {local}");

    let socket = Arc::new(socket);
    let handle = ListenerHandle::new(point, local, groups.udp_io.child_token());

    // the socket is the only channel of the listener, closing one closes the other
    let channel = Arc::new(Channel::datagram(
        inner.next_channel_id(),
        local,
        socket.clone(),
        handle.close.clone(),
    ));

    let decoder = DatagramDecoder::with_min_size(inner.pool.clone(), inner.config.min_datagram_size);
    let mut framed = UdpFramed::new(socket, decoder);
    framed.read_buffer_mut().reserve(inner.config.max_datagram_size);

    groups
        .udp_io
        .spawn(receive_task(inner.clone(), channel, framed, handle.clone()));

    Ok(handle)
}

async fn receive_task(
    inner: Arc<Inner>,
    channel: Arc<Channel>,
    mut framed: UdpFramed<DatagramDecoder, Arc<UdpSocket>>,
    handle: ListenerHandle,
) {
    let _finished = handle.finished.clone().drop_guard();
    let bridge = &inner.bridge;

    bridge.channel_active(&channel);

    loop {
        let item = tokio::select! {
            item = framed.next() => item,
            _ = channel.closed() => break,
        };

        match item {
            Some(Ok((buffer, sender))) => {
                log::trace!(
                    "received datagram of {} bytes from {sender}",
                    buffer.marked_len()
                );

                bridge.datagram_read(&channel, DatagramMessage { buffer, sender });
            }
            Some(Err(e)) => {
                bridge.exception_caught(&channel, e);
                break;
            }
            None => break,
        }
    }

    channel.close();
    bridge.channel_inactive(&channel);

    log::info!("Stopped receiving UDP on {}", handle.local);
}
