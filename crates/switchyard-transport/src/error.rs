/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening an outbound connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// A record grew past the configured limit before it was closed.
    #[error("record of {len} bytes exceeds limit of {max} bytes")]
    RecordTooLarge { len: usize, max: usize },

    /// The stream does not contain a brace-delimited record where one
    /// was expected.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The peer is not draining its outbound queue fast enough.
    #[error("outbound queue full ({capacity} records)")]
    QueueFull { capacity: usize },

    /// Raw I/O failure surfaced by the framing layer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
