use std::sync::Arc;

use thiserror::Error;

use crate::{crypto, MAX_CID_SIZE, MIN_CID_SIZE, MIN_INITIAL_SIZE};

/// Parameters governing the core QUIC state machine
///
/// This should be tuned to suit the application. In particular, window sizes
/// for streams, stream data, and overall connection data should be set
/// differently depending on the expected round trip time, link capacity, and
/// memory availability. Tuning for higher bandwidths and latencies increases
/// worst-case memory consumption, but does not impair performance at lower
/// bandwidths and latencies.
pub struct TransportConfig {
    /// Maximum number of bidirectional streams that may be initiated by the peer
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub stream_window_bidi: u64,
    /// Variant of `stream_window_bidi` affecting unidirectional streams
    pub stream_window_uni: u64,
    /// Maximum duration of inactivity to accept before timing out the
    /// connection, in seconds. The effective value is the minimum of this and
    /// the peer's advertised idle timeout. 0 for none.
    pub idle_timeout: u16,
    /// Maximum number of bytes the peer may transmit on any one stream before
    /// becoming blocked
    pub stream_receive_window: u32,
    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before becoming blocked
    pub receive_window: u32,
    /// Interval after which a PING is sent to keep the connection alive, in
    /// seconds. 0 to disable.
    pub keep_alive_interval: u32,

    /// Maximum number of outstanding packets before loss is assumed on the
    /// basis of newer packets being acknowledged
    pub packet_threshold: u32,
    /// Fraction of an RTT, expressed in 65536ths, added to the reordering
    /// window used for time-based loss detection
    pub time_threshold: u16,
    /// RTT assumed before the first sample is taken, in microseconds
    pub initial_rtt: u64,

    /// UDP payload size to plan packets around, not counting UDP or IP overhead
    pub max_datagram_size: u64,
    /// Limit on outstanding data before any congestion feedback arrives
    pub initial_window: u64,
    /// Floor the congestion window never shrinks below
    pub minimum_window: u64,
    /// Fraction of the congestion window, expressed in 65536ths, retained on
    /// a loss event
    pub loss_reduction_factor: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        const MAX_DATAGRAM_SIZE: u64 = 1460;
        Self {
            stream_window_bidi: 32,
            stream_window_uni: 32,
            idle_timeout: 10,
            stream_receive_window: 1024 * 1024,
            receive_window: 8 * 1024 * 1024,
            keep_alive_interval: 0,

            packet_threshold: 3,
            time_threshold: 0x2000, // 1/8
            initial_rtt: 100_000,

            max_datagram_size: MAX_DATAGRAM_SIZE,
            initial_window: 10 * MAX_DATAGRAM_SIZE,
            minimum_window: 2 * MAX_DATAGRAM_SIZE,
            loss_reduction_factor: 0x8000, // 1/2
        }
    }
}

impl TransportConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_window_bidi > u64::from(u16::MAX)
            || self.stream_window_uni > u64::from(u16::MAX)
        {
            return Err(ConfigError::IllegalValue(
                "stream window exceeds the representable stream count",
            ));
        }
        if (self.max_datagram_size as usize) < MIN_INITIAL_SIZE {
            return Err(ConfigError::IllegalValue(
                "datagram size below the minimum an Initial packet requires",
            ));
        }
        if self.minimum_window < 2 * self.max_datagram_size {
            return Err(ConfigError::IllegalValue(
                "minimum congestion window below two datagrams",
            ));
        }
        Ok(())
    }
}

/// Global configuration for an endpoint
pub struct EndpointConfig<S>
where
    S: crypto::Session,
{
    /// Length of locally-issued connection IDs
    pub local_cid_len: usize,
    /// Key used to derive stateless reset tokens for issued connection IDs
    pub reset_key: S::HmacKey,
}

impl<S> EndpointConfig<S>
where
    S: crypto::Session,
{
    pub fn new(reset_key: S::HmacKey) -> Self {
        Self {
            local_cid_len: 8,
            reset_key,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.local_cid_len != 0
            && !(MIN_CID_SIZE..=MAX_CID_SIZE).contains(&self.local_cid_len)
        {
            return Err(ConfigError::IllegalValue(
                "local connection ID length not representable in a header",
            ));
        }
        Ok(())
    }
}

/// Parameters specific to server endpoints
pub struct ServerConfig<S>
where
    S: crypto::Session,
{
    /// Handshake configuration to use for incoming connections
    pub crypto: S::ServerConfig,
    /// Transport configuration to use for incoming connections
    pub transport: Arc<TransportConfig>,
    /// Maximum number of incoming connections awaiting acceptance by the application
    pub accept_buffer: u32,
}

impl<S> Clone for ServerConfig<S>
where
    S: crypto::Session,
{
    fn clone(&self) -> Self {
        Self {
            crypto: self.crypto.clone(),
            transport: self.transport.clone(),
            accept_buffer: self.accept_buffer,
        }
    }
}

impl<S> ServerConfig<S>
where
    S: crypto::Session,
{
    pub fn new(crypto: S::ServerConfig) -> Self {
        Self {
            crypto,
            transport: Arc::new(TransportConfig::default()),
            accept_buffer: 1024,
        }
    }
}

/// Parameters governing outgoing connections
pub struct ClientConfig<S>
where
    S: crypto::Session,
{
    /// Handshake configuration to use
    pub crypto: S::ClientConfig,
    /// Transport configuration to use
    pub transport: Arc<TransportConfig>,
}

impl<S> Clone for ClientConfig<S>
where
    S: crypto::Session,
{
    fn clone(&self) -> Self {
        Self {
            crypto: self.crypto.clone(),
            transport: self.transport.clone(),
        }
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// A configuration field carried an unusable value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
