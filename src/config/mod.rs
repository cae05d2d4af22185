//! Configuration management
//!
//! Handles config.toml (user-defined) and config.lock (generated with all
//! defaults resolved).

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Load a generated lock file
pub fn load_lock<P: AsRef<Path>>(path: P) -> Result<ConfigLock> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let lock: ConfigLock = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(lock)
}

/// Generate a lock file from config, filling in all defaults
pub fn generate_lock(config: &Config, source_content: &str) -> ConfigLock {
    let source_hash = compute_hash(source_content);
    ConfigLock::from_config(config, source_hash)
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_lock_hashes_source() {
        let source = "[dispatch]\nplugin_timeout_secs = 3\n";
        let config: Config = toml::from_str(source).unwrap();
        let lock = generate_lock(&config, source);

        assert_eq!(lock.dispatch.plugin_timeout_secs, 3);
        assert_eq!(lock.source_hash.len(), 64);
        assert_ne!(lock.source_hash, compute_hash("other content"));
    }

    #[test]
    fn test_lock_roundtrip() {
        let lock = generate_lock(&Config::default(), "");
        let serialized = toml::to_string(&lock).unwrap();
        let parsed: ConfigLock = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.source_hash, lock.source_hash);
        assert_eq!(
            parsed.dispatch.session_idle_secs,
            lock.dispatch.session_idle_secs
        );
    }
}
