//! Relay pool and session manager for Nostr.
//!
//! [`RelayPool`] multiplexes subscriptions, one-shot fetches, publishes
//! and NIP-42 authentication across many relay connections. Sessions are
//! created lazily, woken on demand and put to sleep by a periodic GC when
//! idle; the pool's read/write capabilities are fixed at construction via
//! [`PoolConfig`].
//!
//! ```no_run
//! use nostr_pool::{PoolConfig, RelayPool};
//! use nostr_proto::Filter;
//!
//! # async fn run() -> nostr_pool::Result<()> {
//! let pool = RelayPool::new(PoolConfig::default());
//! pool.add_relay("wss://relay.damus.io").await?;
//!
//! let mut subscription = pool
//!     .subscribe(vec![Filter::new().kinds(vec![1]).limit(10)], None)
//!     .await?;
//! while let Some(update) = subscription.recv().await {
//!     // events and end-of-stored markers, per relay
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod session;
pub mod signer;
pub mod subscription;

pub use config::PoolConfig;
pub use connection::{ConnectionEvent, ConnectionState, RelayConnection};
pub use error::{PoolError, Result};
pub use pool::RelayPool;
pub use session::RelaySession;
pub use signer::{ExtensionSigner, LocalSigner, RemoteSigner, Signer, SignerBridge};
pub use subscription::{
    EoseTracker, Subscription, SubscriptionUpdate, generate_subscription_id,
};
