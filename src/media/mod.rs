//! Local media cache in front of the blob store.

mod entry;
mod eviction;
mod fetcher;
mod key;
mod maintenance;
mod store;
mod upload;
mod writer;

pub use entry::CacheEntry;
pub use eviction::{EvictionPolicy, EvictionReport};
pub use fetcher::{CacheUsage, MediaFetcher};
pub use key::{CacheKey, KeyResolver, MediaType, Owner, UNAFFILIATED_DIR};
pub use store::CacheStore;
pub use upload::MediaUploader;
pub use writer::CacheWriter;

pub(crate) use maintenance::{spawn_cache_dir_cleanup, spawn_eviction_sweeper};
