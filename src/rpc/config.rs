use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ed25519_dalek::SigningKey;

use crate::common::{DEFAULT_FAILURE_THRESHOLD, MAX_BUCKET_SIZE_K};

/// Default port to listen on, falls back to an ephemeral port if busy.
pub const DEFAULT_PORT: u16 = 4222;
/// Default time to wait for a response before retransmitting a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// Default number of retransmissions before a request is considered failed.
pub const DEFAULT_MAX_RETRIES: u8 = 3;
/// Default lookup concurrency factor (α).
pub const DEFAULT_ALPHA: usize = 3;
/// Default maximum number of rounds of a single lookup.
pub const DEFAULT_MAX_ROUNDS: usize = 16;
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Default time after which a good node that wasn't heard from is pinged.
pub const DEFAULT_QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_VALUES_PER_KEY: usize = 64;
pub const DEFAULT_MAX_KEYS: usize = 4096;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to none.
    pub bootstrap: Vec<String>,
    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`, use `::` to listen on IPv6.
    pub bind_address: IpAddr,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [DEFAULT_PORT] then any ephemeral port.
    pub port: Option<u16>,
    /// Time to wait for a response before retransmitting a request,
    /// doubled after every retransmission.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Retransmissions after the first attempt before a request is considered failed.
    ///
    /// Defaults to [DEFAULT_MAX_RETRIES]
    pub max_retries: u8,
    /// Number of parallel requests per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Bucket capacity, and the number of closest nodes lookups converge on.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum rounds of a single lookup.
    ///
    /// Defaults to [DEFAULT_MAX_ROUNDS]
    pub max_rounds: usize,
    /// Minimum number of nodes that must accept an announce for a put to succeed.
    ///
    /// Defaults to `1`
    pub put_quorum: usize,
    /// Consecutive failed requests before a node is considered bad.
    ///
    /// Defaults to [DEFAULT_FAILURE_THRESHOLD]
    pub failure_threshold: u8,
    /// Buckets not changed for this long are refreshed with a lookup to a random id in their range.
    ///
    /// Defaults to [DEFAULT_BUCKET_REFRESH_INTERVAL]
    pub bucket_refresh_interval: Duration,
    /// How often maintenance runs.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// Good nodes not heard from in this long are pinged during maintenance.
    ///
    /// Defaults to [DEFAULT_QUESTIONABLE_AFTER]
    pub questionable_after: Duration,
    /// How often locally put values are re-announced.
    ///
    /// Defaults to [DEFAULT_REPUBLISH_INTERVAL]
    pub republish_interval: Duration,
    /// Lifetime of values put by this node.
    ///
    /// Defaults to [DEFAULT_VALUE_TTL]
    pub value_ttl: Duration,
    /// Defaults to [DEFAULT_MAX_VALUES_PER_KEY]
    pub max_values_per_key: usize,
    /// Maximum number of keys in the value store, least recently used keys are evicted first.
    ///
    /// Defaults to [DEFAULT_MAX_KEYS]
    pub max_keys: usize,
    /// Identity of this node, its id is derived from the public key.
    ///
    /// Defaults to None, where a new key is generated.
    pub signing_key: Option<SigningKey>,
    /// Sign values put by this node.
    ///
    /// Defaults to `true`
    pub enable_signing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: vec![],
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            alpha: DEFAULT_ALPHA,
            k: MAX_BUCKET_SIZE_K,
            max_rounds: DEFAULT_MAX_ROUNDS,
            put_quorum: 1,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            questionable_after: DEFAULT_QUESTIONABLE_AFTER,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            value_ttl: DEFAULT_VALUE_TTL,
            max_values_per_key: DEFAULT_MAX_VALUES_PER_KEY,
            max_keys: DEFAULT_MAX_KEYS,
            signing_key: None,
            enable_signing: true,
        }
    }
}
