//! Configuration file reading and parsing.
//!
//! Locates, reads, and parses INI-format configuration files, with support
//! for a layered override file and individual `name=value` overrides.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use configparser::ini::Ini;
use thiserror::Error;

use super::{CacheSection, Config};

// =============================================================================
// Constants
// =============================================================================

const ENV_CONFIG_FILE: &str = "BNDL_CONFIG_FILE";
const DEFAULT_CONFIG_FILENAME: &str = ".bndlconfig";

const CACHE_SECTION_PREFIX: &str = "cache.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid integer '{value}' for key '{key}': {source}")]
    InvalidInteger {
        key: String,
        value: String,
        source: std::num::ParseIntError,
    },

    #[error("invalid value '{value}' for key '{key}' in section '{section}': {message}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        message: String,
    },

    #[error("unknown key '{key}' in section '{section}'")]
    UnknownKey { section: String, key: String },

    #[error("invalid override '{key}': {message}")]
    InvalidOverrideKey { key: String, message: String },
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

// =============================================================================
// ConfigSource
// =============================================================================

/// Specifies how to locate and layer configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Explicit config file path from the CLI. If specified and it doesn't
    /// exist, error. If None, fall back to BNDL_CONFIG_FILE, then
    /// ~/.bndlconfig (which may be absent).
    pub config_file: Option<PathBuf>,

    /// Additional override config file, layered on top of the base config.
    pub override_file: Option<PathBuf>,

    /// Individual key=value overrides, applied last.
    /// Keys use dot notation: "cache.local.size".
    pub overrides: Vec<(String, String)>,
}

type RawSections = HashMap<String, HashMap<String, Option<String>>>;

impl ConfigSource {
    /// Read and layer the configuration.
    pub fn read(&self) -> Result<Config> {
        let mut sections: RawSections = HashMap::new();

        if let Some(path) = self.locate_base_file()? {
            merge_sections(&mut sections, load_ini(&path)?);
        }
        if let Some(path) = &self.override_file {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            merge_sections(&mut sections, load_ini(path)?);
        }
        self.apply_overrides(&mut sections)?;

        build_config(&sections)
    }

    /// Resolve the base config file: explicit path, env var, then the
    /// default in the home directory. Only an explicit path is required to
    /// exist.
    fn locate_base_file(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.config_file {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            return Ok(Some(path.clone()));
        }

        if let Some(path) = env::var_os(ENV_CONFIG_FILE) {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path));
            }
            return Ok(Some(path));
        }

        if let Some(home) = env::var_os("HOME") {
            let path = PathBuf::from(home).join(DEFAULT_CONFIG_FILENAME);
            if path.is_file() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    fn apply_overrides(&self, sections: &mut RawSections) -> Result<()> {
        for (dotted, value) in &self.overrides {
            let (section, key) =
                dotted
                    .rsplit_once('.')
                    .ok_or_else(|| ConfigError::InvalidOverrideKey {
                        key: dotted.clone(),
                        message: "expected section.key".to_string(),
                    })?;
            sections
                .entry(section.to_lowercase())
                .or_default()
                .insert(key.to_lowercase(), Some(value.clone()));
        }
        Ok(())
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn load_ini(path: &PathBuf) -> Result<RawSections> {
    let mut ini = Ini::new();
    ini.load(path).map_err(|message| ConfigError::ParseError {
        path: path.clone(),
        message,
    })
}

fn merge_sections(base: &mut RawSections, layer: RawSections) {
    for (section, keys) in layer {
        let target = base.entry(section).or_default();
        for (key, value) in keys {
            target.insert(key, value);
        }
    }
}

fn build_config(sections: &RawSections) -> Result<Config> {
    let mut caches = HashMap::new();

    for (section_name, keys) in sections {
        let Some(cache_name) = section_name.strip_prefix(CACHE_SECTION_PREFIX) else {
            continue;
        };
        let cache = parse_cache_section(section_name, keys)?;
        caches.insert(cache_name.to_string(), cache);
    }

    Ok(Config { caches })
}

fn parse_cache_section(
    section: &str,
    keys: &HashMap<String, Option<String>>,
) -> Result<CacheSection> {
    let mut cache = CacheSection::default();

    for (key, value) in keys {
        let value = value.clone().unwrap_or_default();
        match key.as_str() {
            "dir" => cache.dir = Some(PathBuf::from(&value)),
            "bucket" => cache.bucket = Some(value),
            "prefix" => cache.prefix = Some(value),
            "endpoint_url" => cache.endpoint_url = Some(value),
            "region" => cache.region = Some(value),
            "cdn_url" => cache.cdn_url = Some(value),
            "upstream" => cache.upstream = Some(value.to_lowercase()),
            "size" => {
                let size = value.parse().map_err(|source| ConfigError::InvalidInteger {
                    key: format!("{}.{}", section, key),
                    value: value.clone(),
                    source,
                })?;
                cache.size = Some(size);
            }
            "options" => {
                for raw in value.split(',').filter(|s| !s.trim().is_empty()) {
                    let option = raw.parse().map_err(|message| ConfigError::InvalidValue {
                        section: section.to_string(),
                        key: key.clone(),
                        value: value.clone(),
                        message,
                    })?;
                    cache.options.push(option);
                }
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    section: section.to_string(),
                    key: key.clone(),
                });
            }
        }
    }

    Ok(cache)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::CacheOption;
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn source_for(file: &NamedTempFile) -> ConfigSource {
        ConfigSource {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_chain_config() {
        let file = write_config(
            "[cache.local]\n\
             dir = /var/cache/bundles\n\
             size = 500\n\
             upstream = remote\n\
             \n\
             [cache.remote]\n\
             bucket = bundles\n\
             prefix = library\n\
             options = remote, compress\n",
        );

        let config = source_for(&file).read().unwrap();

        let local = &config.caches["local"];
        assert_eq!(local.dir.as_deref().unwrap().to_str(), Some("/var/cache/bundles"));
        assert_eq!(local.size, Some(500));
        assert_eq!(local.upstream.as_deref(), Some("remote"));

        let remote = &config.caches["remote"];
        assert_eq!(remote.bucket.as_deref(), Some("bundles"));
        assert_eq!(remote.prefix.as_deref(), Some("library"));
        assert!(remote.has_option(CacheOption::Remote));
        assert!(remote.has_option(CacheOption::Compress));
        assert!(!remote.has_option(CacheOption::ReadOnly));
    }

    #[test]
    fn test_override_file_and_dotted_overrides_layer() {
        let base = write_config("[cache.local]\ndir = /a\nsize = 10\n");
        let over = write_config("[cache.local]\nsize = 20\n");

        let source = ConfigSource {
            config_file: Some(base.path().to_path_buf()),
            override_file: Some(over.path().to_path_buf()),
            overrides: vec![("cache.local.upstream".to_string(), "remote".to_string())],
        };

        // The dotted override creates no [cache.remote] section; that is
        // the factory's concern, not the parser's.
        let config = source.read().unwrap();
        let local = &config.caches["local"];
        assert_eq!(local.dir.as_deref().unwrap().to_str(), Some("/a"));
        assert_eq!(local.size, Some(20));
        assert_eq!(local.upstream.as_deref(), Some("remote"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let file = write_config("[cache.local]\ndir = /a\nbogus = 1\n");
        assert!(matches!(
            source_for(&file).read(),
            Err(ConfigError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_bad_size_is_rejected() {
        let file = write_config("[cache.local]\ndir = /a\nsize = lots\n");
        assert!(matches!(
            source_for(&file).read(),
            Err(ConfigError::InvalidInteger { .. })
        ));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let file = write_config("[cache.local]\ndir = /a\noptions = sideways\n");
        assert!(matches!(
            source_for(&file).read(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let source = ConfigSource {
            config_file: Some(PathBuf::from("/nonexistent/bndlconfig")),
            ..Default::default()
        };
        assert!(matches!(
            source.read(),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
