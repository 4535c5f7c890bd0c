//! Conversion between raw transport bytes and [`MessageBuffer`]s.
//!
//! None of the decoders look for SIP message boundaries. A stream read produces one
//! fragment containing whatever was readable, it is up to the connection link to
//! accumulate fragments until a complete message is available. A datagram is one message.

use crate::buffer::{BufferPool, MessageBuffer};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio_util::codec::{Decoder, Encoder};

/// Minimum size of a datagram to be considered a message
pub const MIN_DATAGRAM_SIZE: usize = 20;

/// Decoder for stream transports (TCP / TLS)
///
/// Every call with readable bytes emits a new buffer holding all of them.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    pool: BufferPool,
}

impl StreamDecoder {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }
}

impl Decoder for StreamDecoder {
    type Item = MessageBuffer;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut buffer = self.pool.acquire();
        buffer.put_slice(src);
        src.clear();

        log::trace!("decoded stream fragment of {} bytes", buffer.marked_len());

        Ok(Some(buffer))
    }
}

/// Decoder for datagram transports (UDP), each datagram is decoded on its own.
///
/// Datagrams shorter than the configured minimum are consumed without emitting anything.
#[derive(Debug, Clone)]
pub struct DatagramDecoder {
    pool: BufferPool,
    min_size: usize,
}

impl DatagramDecoder {
    pub fn new(pool: BufferPool) -> Self {
        Self::with_min_size(pool, MIN_DATAGRAM_SIZE)
    }

    pub fn with_min_size(pool: BufferPool, min_size: usize) -> Self {
        Self { pool, min_size }
    }
}

impl Decoder for DatagramDecoder {
    type Item = MessageBuffer;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.min_size {
            if !src.is_empty() {
                log::trace!("discarding datagram of {} bytes", src.len());
            }

            // the datagram must be consumed, leftover bytes are an error on eof
            src.clear();
            return Ok(None);
        }

        let mut buffer = self.pool.acquire();
        buffer.put_slice(src);
        src.clear();

        Ok(Some(buffer))
    }
}

/// A decoded datagram together with the address it was received from.
///
/// The peer of a datagram socket is only known per datagram, never per connection.
#[derive(Debug)]
pub struct DatagramMessage {
    pub buffer: MessageBuffer,
    pub sender: SocketAddr,
}

/// Encoder writing the marked bytes of a buffer and resetting it afterwards
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageEncoder;

impl<'a> Encoder<&'a mut MessageBuffer> for MessageEncoder {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: &'a mut MessageBuffer,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.bytes());
        item.reset();

        Ok(())
    }
}

impl Encoder<MessageBuffer> for MessageEncoder {
    type Error = io::Error;

    fn encode(&mut self, mut item: MessageBuffer, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&mut MessageBuffer>::encode(self, &mut item, dst)
    }
}
