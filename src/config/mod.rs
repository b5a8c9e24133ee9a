//! Configuration the consensus core requires.
//!
//! Everything else a production node needs — TLS, env-var overlays,
//! process bootstrap — lives outside the core and is not modeled here.

use std::path::PathBuf;
use std::time::Duration;

use log::info;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered list of peer addresses plus the timing knobs the core uses.
///
/// `peers` may be empty, which puts [`crate::consensus::ConsensusEngine`]
/// into single-node mode (spec.md §4.3).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub peers: Vec<String>,
    #[serde(with = "duration_secs")]
    pub message_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    pub max_publish_attempts: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            message_ttl: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(20),
            max_publish_attempts: 3,
        }
    }
}

impl Configuration {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            ..Default::default()
        }
    }

    /// Quorum size counting the local node: `floor(N/2)+1` out of the
    /// configured peer count plus the local node (spec.md §3, §4.3).
    pub fn quorum_size(&self) -> usize {
        let cluster_size = self.peers.len() + 1;
        cluster_size / 2 + 1
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration file does not exist: '{0}'")]
    ConfigurationFileDoesNotExist(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

type Result<T> = std::result::Result<T, ConfigurationError>;

impl Configuration {
    /// Loads a TOML configuration file, following the same
    /// `config::Config::builder` pattern used for node configuration
    /// elsewhere in this codebase.
    pub fn try_load(path: PathBuf) -> Result<Configuration> {
        if !path.exists() {
            return Err(ConfigurationError::ConfigurationFileDoesNotExist(
                path.display().to_string(),
            ));
        }

        info!("Loading configuration from '{}'", path.display());

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigurationError::Other(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Other(e.to_string()))
    }
}

/// `serde` helper for (de)serializing [`Duration`] as whole seconds, since
/// TOML has no native duration type.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_majority_counting_local_node() {
        let cfg = Configuration::new(vec!["a".into(), "b".into()]);
        assert_eq!(cfg.cluster_size(), 3);
        assert_eq!(cfg.quorum_size(), 2);

        let cfg = Configuration::new(vec!["a".into()]);
        assert_eq!(cfg.cluster_size(), 2);
        assert_eq!(cfg.quorum_size(), 2);

        let cfg = Configuration::new(vec![]);
        assert_eq!(cfg.cluster_size(), 1);
        assert_eq!(cfg.quorum_size(), 1);
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = Configuration::default();
        assert_eq!(cfg.message_ttl, Duration::from_secs(10));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(20));
        assert_eq!(cfg.max_publish_attempts, 3);
    }

    #[test]
    fn try_load_reports_missing_file() {
        let err = Configuration::try_load(PathBuf::from("/nonexistent/chronobus.toml"));
        assert!(matches!(
            err,
            Err(ConfigurationError::ConfigurationFileDoesNotExist(_))
        ));
    }
}
