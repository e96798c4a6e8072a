//! Pool configuration.

use std::time::Duration;

/// Relay pool configuration. Immutable once the pool is constructed.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for establishing a single relay connection
    pub connection_timeout: Duration,
    /// How long a subscription-free session may stay idle before the GC
    /// sweep disconnects its transport
    pub keep_alive: Duration,
    /// Period of the GC sweep
    pub gc_interval: Duration,
    /// Whether subscribe/fetch are permitted
    pub readable: bool,
    /// Whether publish is permitted
    pub writable: bool,
    /// Authenticate to not-yet-authenticated relays before publishing,
    /// when a signer is supplied
    pub auto_auth: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            readable: true,
            writable: true,
            auto_auth: false,
        }
    }
}
