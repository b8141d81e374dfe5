//! Cache subcommands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Subcommand;
use tokio::io::AsyncWriteExt;

use crate::cache::{Cache, Location, PutSource};

use super::args::GlobalArgs;
use super::Result;

/// Operations on a cache chain.
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Materialize a key locally and print its path, or copy it to a file.
    Get {
        /// Cache key (relative path).
        key: String,

        /// Copy the artifact to this path instead of printing the cache path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a file under a key.
    Put {
        /// File to store.
        file: PathBuf,

        /// Cache key (relative path).
        key: String,
    },

    /// Check whether a key is present in the chain.
    Has {
        /// Cache key (relative path).
        key: String,

        /// Expected hex-encoded SHA-256 content hash.
        #[arg(long)]
        hash: Option<String>,
    },

    /// Remove a key.
    Remove {
        /// Cache key (relative path).
        key: String,

        /// Also remove from upstream caches.
        #[arg(long)]
        propagate: bool,
    },

    /// List stored entries.
    List,

    /// Print where a key can be read from (local path or URL).
    Path {
        /// Cache key (relative path).
        key: String,
    },

    /// Print metadata stored for a key.
    Metadata {
        /// Cache key (relative path).
        key: String,
    },

    /// Check cache bookkeeping against the files on disk.
    Verify,

    /// Delete all cached content in the chain.
    Clean,
}

impl CacheCommand {
    pub async fn run(self, cache: Arc<dyn Cache>, global: &GlobalArgs) -> Result<()> {
        match self {
            CacheCommand::Get { key, output } => match output {
                Some(dest) => {
                    let Some(mut stream) = cache.get_stream(&key).await? else {
                        return Err(super::CliError::NotFound(key));
                    };
                    let mut file = tokio::fs::File::create(&dest).await?;
                    tokio::io::copy(&mut stream, &mut file).await?;
                    file.flush().await?;
                    println!("{}", dest.display());
                }
                None => match cache.get(&key).await? {
                    Some(path) => println!("{}", path.display()),
                    None => return Err(super::CliError::NotFound(key)),
                },
            },

            CacheCommand::Put { file, key } => {
                cache.put(PutSource::Path(file), &key, None).await?;
                println!("{}", key);
            }

            CacheCommand::Has { key, hash } => {
                let present = cache.has(&key, hash.as_deref()).await?;
                if global.json {
                    println!("{}", serde_json::json!({ "key": key, "present": present }));
                } else {
                    println!("{}", present);
                }
                if !present {
                    std::process::exit(1);
                }
            }

            CacheCommand::Remove { key, propagate } => {
                cache.remove(&key, propagate).await?;
            }

            CacheCommand::List => {
                let entries = cache.list().await?;
                if global.json {
                    let value: serde_json::Map<String, serde_json::Value> = entries
                        .iter()
                        .map(|(key, entry)| {
                            (key.clone(), serde_json::json!({ "size": entry.size }))
                        })
                        .collect();
                    println!("{}", serde_json::Value::Object(value));
                } else {
                    for (key, entry) in entries {
                        println!("{}\t{}", entry.size, key);
                    }
                }
            }

            CacheCommand::Path { key } => match cache.path(&key).await? {
                Some(Location::Local(path)) => println!("{}", path.display()),
                Some(Location::Url(url)) => println!("{}", url),
                None => return Err(super::CliError::NotFound(key)),
            },

            CacheCommand::Metadata { key } => {
                let metadata = cache.metadata(&key).await?;
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }

            CacheCommand::Verify => {
                cache.verify().await?;
                println!("ok");
            }

            CacheCommand::Clean => {
                cache.clean().await?;
            }
        }
        Ok(())
    }
}
