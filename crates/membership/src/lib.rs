//! Cluster membership over a shared key-value store with expiring keys.
//!
//! Every node periodically publishes its own liveness record with a TTL and
//! keeps an index set of known node ids; a pattern subscription on the
//! store's key-change notifications plus a periodic full resynchronization
//! keep the hosting application's view of the cluster converged with the
//! store's authoritative content.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use fleet_membership::{MembershipMonitor, MonitorConfig};
//! use fleet_membership_redis::{RedisRegistry, RedisRegistryOptions};
//!
//! let registry = RedisRegistry::new(RedisRegistryOptions::default()).await?;
//! let monitor = MembershipMonitor::new(
//!     app.clone(), // implements ServerDirectory
//!     registry.clone(),
//!     registry,
//!     MonitorConfig::default(),
//! );
//!
//! monitor.start().await?;
//! // ... the application's routing table now tracks the cluster ...
//! monitor.stop().await?;
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod directory;
mod error;
mod event;
mod monitor;
mod record;
mod registry;

pub use directory::ServerDirectory;
pub use error::Error;
pub use event::KeyEventKind;
pub use monitor::{DEFAULT_PREFIX, DEFAULT_SET_KEY, MembershipMonitor, MonitorConfig};
pub use record::{ServerRecord, ServerState};
pub use registry::{
    ChangeFeed, ChangeFeedError, KeyNotification, RegistryError, RegistryStore,
};
