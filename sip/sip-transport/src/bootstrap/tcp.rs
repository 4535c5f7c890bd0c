use super::{EventLoopGroups, Inner, ListenerHandle};
use crate::channel::Channel;
use crate::codec::StreamDecoder;
use crate::error::{Error, Result};
use crate::listening::ListeningConnection;
use crate::listening_point::ListeningPoint;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(super) async fn bind(
    inner: &Arc<Inner>,
    groups: &EventLoopGroups,
    point: Arc<ListeningPoint>,
) -> Result<ListenerHandle> {
    let mut listening = ListeningConnection::new(point.clone(), inner.resolver.clone())
        .with_connect_options(inner.config.connect_timeout, inner.config.tcp_keep_alive);

    if let Some(dispatcher) = &inner.dispatcher {
        listening = listening.with_dispatcher(dispatcher.clone());
    }

    let local = listening.listen().await?;

    log::info!("Accepting TCP connections on {local}");

    let handle = ListenerHandle::new(point, local, groups.tcp_accept.child_token());

    groups
        .tcp_accept
        .spawn(task_accept(inner.clone(), listening, handle.clone()));

    Ok(handle)
}

async fn task_accept(inner: Arc<Inner>, listening: ListeningConnection, handle: ListenerHandle) {
    let _finished = handle.finished.clone().drop_guard();

    loop {
        let accepted = tokio::select! {
            accepted = listening.accept() => accepted,
            _ = handle.close.cancelled() => break,
        };

        match accepted {
            Ok((stream, connection)) => {
                if let Err(e) = spawn_connection(&inner, stream, connection.remote()) {
                    log::error!("Could not set up incoming connection, {e}");
                }
            }
            Err(Error::NotListening) => break,
            Err(e) => {
                log::error!("Error accepting connection, {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    listening.close();

    log::info!("Stopped accepting TCP connections on {}", handle.local);
}

fn spawn_connection(inner: &Arc<Inner>, stream: TcpStream, remote: SocketAddr) -> io::Result<()> {
    let groups = inner.groups().map_err(io::Error::other)?;

    let socket = SockRef::from(&stream);
    socket.set_keepalive(inner.config.tcp_keep_alive)?;
    stream.set_nodelay(inner.config.tcp_nodelay)?;

    let local = stream.local_addr()?;

    log::trace!("Connection accepted from {remote} on {local}");

    let (read, write) = stream.into_split();

    let channel = Arc::new(Channel::stream(
        inner.next_channel_id(),
        local,
        remote,
        write,
        groups.tcp_io.child_token(),
    ));

    let framed = FramedRead::new(read, StreamDecoder::new(inner.pool.clone()));

    groups.tcp_io.spawn(receive_task(inner.clone(), channel, framed));

    Ok(())
}

async fn receive_task(
    inner: Arc<Inner>,
    channel: Arc<Channel>,
    mut framed: FramedRead<OwnedReadHalf, StreamDecoder>,
) {
    let bridge = &inner.bridge;

    bridge.channel_active(&channel);

    loop {
        let item = tokio::select! {
            item = framed.next() => item,
            _ = channel.closed() => break,
        };

        match item {
            Some(Ok(buffer)) => bridge.channel_read(&channel, buffer),
            Some(Err(e)) => {
                bridge.exception_caught(&channel, e);
                break;
            }
            None => {
                log::debug!("Connection closed by peer {channel}");
                break;
            }
        }
    }

    channel.close();
    channel.shutdown().await;

    bridge.channel_inactive(&channel);
}
