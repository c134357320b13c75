//! Content-addressed caching of directory trees between runs.

mod key;
mod store;

pub use key::{host_platform, CacheBinding, CacheKey, PrefixLevel, SHORT_HASH_LEN};
pub use store::{copy_tree, CacheHit, CacheStore, FsCacheStore};
