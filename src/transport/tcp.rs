use crate::packet::{Packet, PacketCodec};
use crate::transport::{Connector, Transport, TransportError};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Debug)]
pub struct TcpConnector {
    connect_timeout: Duration,
    recv_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, recv_timeout: Duration) -> Self {
        TcpConnector {
            connect_timeout,
            recv_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        stream.set_nodelay(true)?;

        Ok(Arc::new(TcpTransport::new(stream, self.recv_timeout)))
    }
}

/// Stream-socket transport. Send and receive sides lock independently so a pipeline can transmit
/// while another task waits on a reply.
pub struct TcpTransport {
    reader: Mutex<ReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    recv_timeout: Duration,
}

struct ReadHalf {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    codec: PacketCodec,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, recv_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();

        TcpTransport {
            reader: Mutex::new(ReadHalf {
                stream: read_half,
                buffer: BytesMut::with_capacity(4096),
                codec: PacketCodec::new(),
            }),
            writer: Mutex::new(write_half),
            recv_timeout,
        }
    }
}

impl ReadHalf {
    async fn read_message(&mut self) -> Result<crate::packet::WireMessage, TransportError> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(message);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let mut frame = BytesMut::new();
        PacketCodec::new().encode(packet.request(), &mut frame)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;

        Ok(())
    }

    async fn recv(&self, packet: &mut Packet) -> Result<(), TransportError> {
        let mut reader = self.reader.lock().await;
        let message = tokio::time::timeout(self.recv_timeout, reader.read_message())
            .await
            .map_err(|_| TransportError::Timeout(self.recv_timeout))??;
        packet.set_reply(message);

        Ok(())
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
