//! Broker and client configuration.
//!
//! Everything is programmatic: build a config from `Default` and override
//! the fields you care about.

use std::time::Duration;

use switchyard_protocol::FragmentConfig;

/// What the broker does with a non-handshake envelope received on a
/// connection that has not completed its handshake.
///
/// Such envelopes are never routed either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreHandshakePolicy {
    /// Log and drop the envelope; keep waiting for the handshake.
    Drop,
    /// Send a protocol-violation notice and close the connection.
    #[default]
    Disconnect,
}

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a new connection may take to send an acceptable
    /// handshake. Connections still pending after this get an error
    /// notice (code 408) and are closed.
    pub handshake_timeout: Duration,

    /// Policy for traffic that arrives before the handshake.
    pub pre_handshake: PreHandshakePolicy,

    /// Fragmentation threshold and reassembly limits.
    pub fragment: FragmentConfig,

    /// How often incomplete fragment groups older than
    /// `fragment.group_ttl` are swept.
    pub sweep_interval: Duration,

    /// Largest record accepted from a connection, in bytes.
    pub max_record: usize,

    /// Records that may wait in one connection's outbound queue. A member
    /// that falls this far behind is disconnected.
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            pre_handshake: PreHandshakePolicy::default(),
            fragment: FragmentConfig::default(),
            sweep_interval: Duration::from_secs(15),
            max_record: switchyard_transport::RecordCodec::DEFAULT_MAX_RECORD,
            outbound_capacity: 1024,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `connect` waits for the broker's roster.
    pub handshake_timeout: Duration,

    /// Fragmentation threshold and reassembly limits.
    pub fragment: FragmentConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            fragment: FragmentConfig::default(),
        }
    }
}
