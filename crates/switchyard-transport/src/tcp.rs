//! TCP transport: a listener for the broker and a framed connection used
//! on both sides.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{Connection, ConnectionId, RecordCodec, Transport, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    /// `None` once shut down; dropping the listener releases the port.
    listener: Option<TcpListener>,
    max_record: usize,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self {
            listener: Some(listener),
            max_record: RecordCodec::DEFAULT_MAX_RECORD,
        })
    }

    /// Sets the largest record accepted on connections from this listener.
    pub fn max_record(mut self, len: usize) -> Self {
        self.max_record = len;
        self
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport shut down",
            )),
        }
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let listener =
            self.listener.as_ref().ok_or(TransportError::Shutdown)?;
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let conn = TcpConnection::from_stream(stream, self.max_record)?;
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    async fn shutdown(&mut self) -> Result<(), Self::Error> {
        if let Some(listener) = self.listener.take() {
            tracing::info!(addr = ?listener.local_addr().ok(), "TCP transport stopped listening");
        }
        Ok(())
    }
}

/// A single framed TCP connection.
///
/// Reads and writes are guarded independently, so one task can block in
/// [`recv`](Connection::recv) while another sends.
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    reader: Mutex<FramedRead<OwnedReadHalf, RecordCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, RecordCodec>>,
}

impl TcpConnection {
    /// Opens an outbound connection to `addr`.
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::ConnectFailed)?;
        let conn =
            Self::from_stream(stream, RecordCodec::DEFAULT_MAX_RECORD)?;
        tracing::debug!(id = %conn.id, peer = %conn.peer, "connected");
        Ok(conn)
    }

    /// Wraps an established stream.
    pub fn from_stream(
        stream: TcpStream,
        max_record: usize,
    ) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            id: next_connection_id(),
            peer,
            reader: Mutex::new(FramedRead::new(
                read,
                RecordCodec::with_max_len(max_record),
            )),
            writer: Mutex::new(FramedWrite::new(
                write,
                RecordCodec::with_max_len(max_record),
            )),
        })
    }

    /// Returns the remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for TcpConnection {
    type Error = TransportError;

    /// Writes one record and flushes it; returns once the bytes are handed
    /// to the kernel.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let mut writer = self.writer.lock().await;
        writer.send(data).await.map_err(|e| match e {
            TransportError::Io(io) => TransportError::SendFailed(io),
            other => other,
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(Ok(record)) => Ok(Some(record.to_vec())),
            Some(Err(TransportError::Io(io))) => {
                Err(TransportError::ReceiveFailed(io))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let mut writer = self.writer.lock().await;
        SinkExt::<&[u8]>::close(&mut *writer)
            .await
            .map_err(|e| match e {
                TransportError::Io(io) => TransportError::SendFailed(io),
                other => other,
            })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
