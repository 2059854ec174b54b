//! Server configuration: an optional RON file, overridden by CLI flags.
//!
//! ```ron
//! (
//!     bind: "0.0.0.0:7878",
//!     denied_collections: ["boards"],
//!     list_timeout_ms: 2000,
//! )
//! ```
//!
//! Every field is optional; missing ones take the defaults below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use worktable_store::{DEFAULT_COLLECTIONS, MemoryStoreConfig};

use crate::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_LIST_TIMEOUT, DEFAULT_LOG_FILTER, DEFAULT_PORT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("invalid bind address {0:?}")]
    InvalidBind(String),

    #[error("denied collection {0:?} is not served")]
    UnknownDenied(String),
}

/// Command-line flags.
#[derive(Debug, Default, Parser)]
#[command(name = "worktable-server", about = "Live task-management collections over HTTP")]
pub struct Args {
    /// RON config file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:7878. Overrides the config file.
    #[arg(long, short)]
    pub bind: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port` to listen on.
    pub bind: String,
    /// Collections the store serves.
    pub collections: Vec<String>,
    /// Collections whose queries the store refuses.
    pub denied_collections: Vec<String>,
    pub push_buffer: usize,
    pub feed_capacity: usize,
    /// Upper bound on waiting for a list's first snapshot.
    pub list_timeout_ms: u64,
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let store = MemoryStoreConfig::default();
        Self {
            bind: format!("{DEFAULT_BIND_ADDRESS}:{DEFAULT_PORT}"),
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            denied_collections: Vec::new(),
            push_buffer: store.push_buffer,
            feed_capacity: store.feed_capacity,
            list_timeout_ms: DEFAULT_LIST_TIMEOUT.as_millis() as u64,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ServerConfig {
    /// Read a RON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Config file (if any) with CLI overrides applied, then validated.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(bind) = &args.bind {
            config.bind = bind.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if let Some(denied) = self
            .denied_collections
            .iter()
            .find(|d| !self.collections.contains(d))
        {
            return Err(ConfigError::UnknownDenied(denied.clone()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            collections: self.collections.clone(),
            push_buffer: self.push_buffer,
            feed_capacity: self.feed_capacity,
        }
    }
}
