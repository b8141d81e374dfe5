//! Cache chain assembly.
//!
//! Builds a chain from configuration, resolving each section's `upstream`
//! reference recursively before constructing the section's own node, so
//! every node is initialized with its already-built upstream. Decorators
//! apply in a fixed order: the raw node is constructed first (remote or
//! local, with the upstream-read-only marker), compression wraps the raw
//! node, and the read-only view goes outermost.

use std::sync::Arc;

use crate::config::{CacheOption, CacheSection, Config};

use super::compression::FsCompressionCache;
use super::fs_cache::FsCache;
use super::limited_cache::FsLimitedCache;
use super::readonly::ReadOnlyCache;
use super::s3_cache::{S3Cache, S3CacheConfig};
use super::{Cache, Error, Result};

/// Build the cache chain rooted at the named `[cache.<name>]` section.
pub async fn new_cache(name: &str, config: &Config) -> Result<Arc<dyn Cache>> {
    let mut visiting = Vec::new();
    build_cache(name, config, &mut visiting).await
}

async fn build_cache(
    name: &str,
    config: &Config,
    visiting: &mut Vec<String>,
) -> Result<Arc<dyn Cache>> {
    if visiting.iter().any(|seen| seen == name) {
        return Err(Error::Config(format!(
            "upstream cycle: {} -> {}",
            visiting.join(" -> "),
            name
        )));
    }
    visiting.push(name.to_string());

    let section = config
        .caches
        .get(name)
        .ok_or_else(|| Error::Config(format!("no [cache.{}] section", name)))?;
    validate_section(name, section)?;

    let upstream = match &section.upstream {
        Some(upstream_name) => Some(Box::pin(build_cache(upstream_name, config, visiting)).await?),
        None => None,
    };
    visiting.pop();

    let node: Arc<dyn Cache> = if let Some(bucket) = &section.bucket {
        let mut s3_config = S3CacheConfig::new(bucket);
        if let Some(prefix) = &section.prefix {
            s3_config = s3_config.with_prefix(prefix);
        }
        if let Some(endpoint) = &section.endpoint_url {
            s3_config = s3_config.with_endpoint_url(endpoint);
        }
        if let Some(region) = &section.region {
            s3_config = s3_config.with_region(region);
        }
        if let Some(cdn) = &section.cdn_url {
            s3_config = s3_config.with_cdn_url(cdn);
        }
        Arc::new(S3Cache::new(s3_config).await)
    } else {
        let dir = section
            .dir
            .as_ref()
            .ok_or_else(|| Error::Config(format!("[cache.{}] needs 'dir' or 'bucket'", name)))?;
        let upstream_readonly = section.has_option(CacheOption::UpstreamReadOnly);

        match (section.size_bytes(), upstream) {
            (Some(maxsize), Some(upstream)) => {
                let cache = FsLimitedCache::with_upstream(dir, maxsize, upstream)?;
                Arc::new(if upstream_readonly {
                    cache.upstream_readonly()
                } else {
                    cache
                })
            }
            (Some(maxsize), None) => Arc::new(FsLimitedCache::new(dir, maxsize)?),
            (None, Some(upstream)) => {
                let cache = FsCache::with_upstream(dir, upstream)?;
                Arc::new(if upstream_readonly {
                    cache.upstream_readonly()
                } else {
                    cache
                })
            }
            (None, None) => Arc::new(FsCache::new(dir)?),
        }
    };

    let node: Arc<dyn Cache> = if section.has_option(CacheOption::Compress) {
        Arc::new(FsCompressionCache::new(node))
    } else {
        node
    };

    let node: Arc<dyn Cache> = if section.has_option(CacheOption::ReadOnly) {
        Arc::new(ReadOnlyCache::new(node))
    } else {
        node
    };

    Ok(node)
}

fn validate_section(name: &str, section: &CacheSection) -> Result<()> {
    if section.bucket.is_some() && section.dir.is_some() {
        return Err(Error::Config(format!(
            "[cache.{}] sets both 'dir' and 'bucket'",
            name
        )));
    }
    if section.bucket.is_some() {
        if section.upstream.is_some() {
            return Err(Error::Config(format!(
                "[cache.{}] is a remote store and cannot have an upstream",
                name
            )));
        }
        if section.size.is_some() {
            return Err(Error::Config(format!(
                "[cache.{}] is a remote store and cannot be size-bounded",
                name
            )));
        }
    } else {
        if section.has_option(CacheOption::Remote) {
            return Err(Error::Config(format!(
                "[cache.{}] has the 'remote' option but no 'bucket'",
                name
            )));
        }
        if section.has_option(CacheOption::UpstreamReadOnly) && section.upstream.is_none() {
            return Err(Error::Config(format!(
                "[cache.{}] has 'usreadonly' but no 'upstream'",
                name
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::PutSource;
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config_from(sections: Vec<(&str, CacheSection)>) -> Config {
        Config {
            caches: sections
                .into_iter()
                .map(|(name, section)| (name.to_string(), section))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn local_section(dir: &TempDir) -> CacheSection {
        CacheSection {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_level_chain_writes_through() {
        let local_dir = TempDir::new().unwrap();
        let upstream_dir = TempDir::new().unwrap();

        let config = config_from(vec![
            (
                "local",
                CacheSection {
                    upstream: Some("store".to_string()),
                    ..local_section(&local_dir)
                },
            ),
            ("store", local_section(&upstream_dir)),
        ]);

        let cache = new_cache("local", &config).await.unwrap();
        cache
            .put(PutSource::from(b"data".to_vec()), "k", None)
            .await
            .unwrap();

        assert!(local_dir.path().join("k").is_file());
        assert!(upstream_dir.path().join("k").is_file());
    }

    #[tokio::test]
    async fn test_compressed_upstream_stores_gzip() {
        let local_dir = TempDir::new().unwrap();
        let upstream_dir = TempDir::new().unwrap();

        let config = config_from(vec![
            (
                "local",
                CacheSection {
                    upstream: Some("store".to_string()),
                    ..local_section(&local_dir)
                },
            ),
            (
                "store",
                CacheSection {
                    options: vec![CacheOption::Compress],
                    ..local_section(&upstream_dir)
                },
            ),
        ]);

        let cache = new_cache("local", &config).await.unwrap();
        cache
            .put(PutSource::from(b"hello world".to_vec()), "k", None)
            .await
            .unwrap();

        // Local copy is plain; the compressed upstream stores gzip under the
        // renamed key.
        assert_eq!(
            std::fs::read(local_dir.path().join("k")).unwrap(),
            b"hello world"
        );
        let raw = std::fs::read(upstream_dir.path().join("k.gz")).unwrap();
        assert_eq!(&raw[..2], [0x1f, 0x8b]);

        // And the chain reads it back transparently.
        std::fs::remove_file(local_dir.path().join("k")).unwrap();
        let path = cache.get("k").await.unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_size_bound_selects_limited_cache() {
        let dir = TempDir::new().unwrap();
        let config = config_from(vec![(
            "local",
            CacheSection {
                size: Some(1),
                ..local_section(&dir)
            },
        )]);

        let cache = new_cache("local", &config).await.unwrap();
        cache
            .put(PutSource::from(vec![0u8; 16]), "k", None)
            .await
            .unwrap();

        // The limited cache keeps its index in the reserved subdirectory.
        assert!(dir.path().join(".index").is_dir());
        cache.verify().await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_option_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = config_from(vec![(
            "local",
            CacheSection {
                options: vec![CacheOption::ReadOnly],
                ..local_section(&dir)
            },
        )]);

        let cache = new_cache("local", &config).await.unwrap();
        assert!(matches!(
            cache.put(PutSource::from(b"x".to_vec()), "k", None).await,
            Err(Error::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_upstream_cycle_is_rejected() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let config = config_from(vec![
            (
                "a",
                CacheSection {
                    upstream: Some("b".to_string()),
                    ..local_section(&dir_a)
                },
            ),
            (
                "b",
                CacheSection {
                    upstream: Some("a".to_string()),
                    ..local_section(&dir_b)
                },
            ),
        ]);

        let err = new_cache("a", &config).await.err().unwrap();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_unknown_section_is_rejected() {
        let config = config_from(vec![]);
        let err = new_cache("missing", &config).await.err().unwrap();
        assert!(err.to_string().contains("no [cache.missing]"));
    }

    #[tokio::test]
    async fn test_conflicting_sections_are_rejected() {
        let dir = TempDir::new().unwrap();

        // dir + bucket conflict.
        let config = config_from(vec![(
            "c",
            CacheSection {
                bucket: Some("b".to_string()),
                ..local_section(&dir)
            },
        )]);
        assert!(new_cache("c", &config).await.is_err());

        // remote option without a bucket.
        let config = config_from(vec![(
            "c",
            CacheSection {
                options: vec![CacheOption::Remote],
                dir: Some(PathBuf::from(dir.path())),
                ..Default::default()
            },
        )]);
        assert!(new_cache("c", &config).await.is_err());

        // usreadonly without an upstream.
        let config = config_from(vec![(
            "c",
            CacheSection {
                options: vec![CacheOption::UpstreamReadOnly],
                ..local_section(&dir)
            },
        )]);
        assert!(new_cache("c", &config).await.is_err());
    }
}
