use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ed25519_dalek::SigningKey;

use crate::common::{PeerRecord, MAX_BUCKET_SIZE_K};
use crate::core::lookup::{
    LookupParams, DEFAULT_ALPHA, DEFAULT_LOOKUP_PARALLELISM, DEFAULT_LOOKUP_TIMEOUT,
};
use crate::core::routing_maintenance::{PING_TABLE_INTERVAL, REFRESH_TABLE_INTERVAL};

use super::socket::transport::Transport;
use super::socket::DEFAULT_REQUEST_TIMEOUT;
use super::talk::TalkHandler;

pub const DEFAULT_SESSION_CAPACITY: usize = 1000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug)]
/// Discovery node configurations
pub struct Config {
    /// Key signing the local record and proving our identity in handshakes.
    ///
    /// Defaults to a fresh random key.
    pub signing_key: Option<SigningKey>,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: IpAddr,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the OS picks a free port.
    pub port: Option<u16>,
    /// Address advertised in the local record.
    ///
    /// Defaults to None, where the bound address is advertised unless it is unspecified,
    /// in which case the record carries no address and peers can not query us.
    pub external_address: Option<SocketAddr>,
    /// Records of nodes to seed the routing table with.
    pub bootstrap: Vec<PeerRecord>,
    /// Request timeout duration, also bounding how long a handshake may stay pending.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Peers queried concurrently by each lookup lane.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Number of disjoint lanes a lookup runs.
    ///
    /// Defaults to [DEFAULT_LOOKUP_PARALLELISM]
    pub lookup_parallelism: usize,
    /// Nodes per routing table bucket, also the lookup result size.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub bucket_size: usize,
    /// Deadline shared by all the lanes of a lookup.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub lookup_timeout: Duration,
    /// Maximum number of cached sessions.
    ///
    /// Defaults to [DEFAULT_SESSION_CAPACITY]
    pub session_capacity: usize,
    /// Consecutive decryption failures before a session is demoted.
    ///
    /// Defaults to [DEFAULT_FAILURE_THRESHOLD]
    pub failure_threshold: u32,
    /// Interval between lookups of our own id to refresh the routing table.
    pub refresh_interval: Duration,
    /// Interval between pings of quiet nodes in the routing table.
    pub ping_interval: Duration,
    /// Handler of inbound talk requests.
    ///
    /// Defaults to None, where [super::talk::DefaultTalkHandler] answers empty responses.
    pub talk_handler: Option<Box<dyn TalkHandler>>,
    /// Datagram transport.
    ///
    /// Defaults to None, where a UDP socket is bound to `bind_address` and `port`.
    pub transport: Option<Box<dyn Transport>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signing_key: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            external_address: None,
            bootstrap: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            alpha: DEFAULT_ALPHA,
            lookup_parallelism: DEFAULT_LOOKUP_PARALLELISM,
            bucket_size: MAX_BUCKET_SIZE_K,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            session_capacity: DEFAULT_SESSION_CAPACITY,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            refresh_interval: REFRESH_TABLE_INTERVAL,
            ping_interval: PING_TABLE_INTERVAL,
            talk_handler: None,
            transport: None,
        }
    }
}

impl Config {
    /// Reject configurations the node can not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alpha == 0 {
            return Err(ConfigError::ZeroAlpha);
        }
        if self.lookup_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.bucket_size == 0 {
            return Err(ConfigError::ZeroBucketSize);
        }
        if self.session_capacity == 0 {
            return Err(ConfigError::ZeroSessionCapacity);
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }

        Ok(())
    }

    pub(crate) fn lookup_params(&self) -> LookupParams {
        LookupParams {
            alpha: self.alpha,
            parallelism: self.lookup_parallelism,
            k: self.bucket_size,
            timeout: self.lookup_timeout,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Invalid [Config].
pub enum ConfigError {
    #[error("alpha must be at least 1")]
    ZeroAlpha,

    #[error("lookup parallelism must be at least 1")]
    ZeroParallelism,

    #[error("bucket size must be at least 1")]
    ZeroBucketSize,

    #[error("session capacity must be at least 1")]
    ZeroSessionCapacity,

    #[error("failure threshold must be at least 1")]
    ZeroFailureThreshold,
}
