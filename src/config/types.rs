//! Configuration types.
//!
//! Application configuration is parsed from an INI-format config file into
//! these structures. Each `[cache.<name>]` section describes one node of a
//! cache chain; `upstream` references link sections into chains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Bytes per configured megabyte.
///
/// Two bytes over 2^20. Kept deliberately: eviction thresholds in existing
/// deployments were tuned against this constant, and changing it would
/// silently shift when eviction triggers.
pub const LEGACY_MB_BYTES: u64 = 1_048_578;

// =============================================================================
// Cache Options
// =============================================================================

/// Flags applied to a cache section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOption {
    /// Mark the node as a remote object store.
    Remote,
    /// Wrap the node with transparent gzip compression.
    Compress,
    /// Expose the node as a read-only view.
    ReadOnly,
    /// Treat the node's upstream as read-only: no write-through.
    UpstreamReadOnly,
}

impl FromStr for CacheOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "remote" => Ok(CacheOption::Remote),
            "compress" => Ok(CacheOption::Compress),
            "readonly" => Ok(CacheOption::ReadOnly),
            "usreadonly" => Ok(CacheOption::UpstreamReadOnly),
            other => Err(format!("unknown cache option '{}'", other)),
        }
    }
}

// =============================================================================
// Cache Section
// =============================================================================

/// `[cache.<name>]` section - one node of a cache chain.
#[derive(Debug, Clone, Default)]
pub struct CacheSection {
    /// Local cache root directory.
    pub dir: Option<PathBuf>,
    /// S3 bucket name.
    pub bucket: Option<String>,
    /// Key prefix within the bucket.
    pub prefix: Option<String>,
    /// Custom S3 endpoint URL (LocalStack, MinIO).
    pub endpoint_url: Option<String>,
    /// S3 region override.
    pub region: Option<String>,
    /// CDN base URL fronting the bucket.
    pub cdn_url: Option<String>,
    /// Eviction threshold in configured megabytes.
    pub size: Option<u64>,
    /// Name of the upstream `[cache.<name>]` section.
    pub upstream: Option<String>,
    /// Option flags.
    pub options: Vec<CacheOption>,
}

impl CacheSection {
    /// The eviction threshold in bytes, if a size is configured.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.map(|mb| mb.saturating_mul(LEGACY_MB_BYTES))
    }

    /// Whether an option flag is set.
    pub fn has_option(&self, option: CacheOption) -> bool {
        self.options.contains(&option)
    }
}

// =============================================================================
// Top-Level Config
// =============================================================================

/// Complete application configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cache sections by name.
    pub caches: HashMap<String, CacheSection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_parsing() {
        assert_eq!("remote".parse::<CacheOption>().unwrap(), CacheOption::Remote);
        assert_eq!(
            " usreadonly ".parse::<CacheOption>().unwrap(),
            CacheOption::UpstreamReadOnly
        );
        assert!("bogus".parse::<CacheOption>().is_err());
    }

    #[test]
    fn test_size_uses_legacy_multiplier() {
        let section = CacheSection {
            size: Some(10),
            ..Default::default()
        };
        assert_eq!(section.size_bytes(), Some(10 * 1_048_578));
        assert_ne!(section.size_bytes(), Some(10 * 1_048_576));
    }
}
