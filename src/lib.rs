//! bundlecache - a tiered cache chain for bundle artifacts.
//!
//! Moves versioned bundle files between local disk, compressed storage,
//! and S3-backed remotes through a chain of cache nodes sharing one
//! capability interface.

pub mod cache;
pub mod cli;
pub mod config;

pub use cache::{
    Cache, CacheSink, Error, FsCache, FsCompressionCache, FsLimitedCache, ListEntry, Location,
    META_CONTENT_ENCODING, META_CONTENT_HASH, Metadata, PutSource, ReadOnlyCache, Result, S3Cache,
    S3CacheConfig, new_cache,
};
pub use config::{CacheOption, CacheSection, Config, ConfigSource};
