//! Coordinator configuration
//!
//! Loaded from a JSON file; every field has a default so partial files work.

use crate::error::Result;
use crate::network::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lifetime of a signing session (10 minutes)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 600;

/// Default lifetime of a signer advertisement (1 hour)
pub const DEFAULT_ADVERTISEMENT_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lifetime of a signing session
    pub session_ttl_secs: u64,
    /// Lifetime of our own advertisement
    pub advertisement_ttl_secs: u64,
    /// How often expired advertisements are swept from the cache
    pub cache_sweep_interval_secs: u64,
    /// Poll interval of the session connection monitor
    pub monitor_interval_ms: u64,
    /// Backoff for dialing participants
    pub connect_retry: RetryPolicy,
    /// The bounded reconnect made when a participant drops mid-session
    pub reconnect: RetryPolicy,
    /// Where session history is stored
    pub data_dir: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            advertisement_ttl_secs: DEFAULT_ADVERTISEMENT_TTL_SECS,
            cache_sweep_interval_secs: 60,
            monitor_interval_ms: 5000,
            connect_retry: RetryPolicy::default(),
            reconnect: RetryPolicy::single(500),
            data_dir: PathBuf::from(".cosign_data"),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn advertisement_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.advertisement_ttl_secs as i64)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosign.json");

        let config = CoordinatorConfig {
            session_ttl_secs: 120,
            connect_retry: RetryPolicy::new(5, 250, 4000),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosign.json");
        fs::write(&path, r#"{ "monitor_interval_ms": 250 }"#).unwrap();

        let loaded = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(loaded.monitor_interval_ms, 250);
        assert_eq!(loaded.session_ttl_secs, DEFAULT_SESSION_TTL_SECS);
        assert_eq!(loaded.reconnect, RetryPolicy::single(500));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CoordinatorConfig::load_or_default(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, CoordinatorConfig::default());
    }
}
