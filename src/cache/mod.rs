//! Two-tier entity cache.
//!
//! - [`EntityCache`]: in-process map, the first tier
//! - [`CacheProvider`]: persistent second tier, [`DiskCacheProvider`] on SQLite
//! - [`TieredCache`]: read-through over both tiers and the remote store
//!
//! Lookups by ID set return a [`CacheSet`] splitting hits from the IDs still wanted.

pub mod disk;
mod layer;
pub mod memory;
mod provider;
mod record;
mod traits;

pub use disk::{DiskCacheProvider, FaultHook};
pub use layer::{Fetched, TieredCache};
pub use memory::EntityCache;
pub use provider::{CacheProvider, NoopProvider, ProviderInvalidator};
pub use record::parse_id;
pub use traits::{CacheSet, Cacheable, IdRule};
