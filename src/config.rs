//! Configuration accepted by the vault constructor.

use std::path::PathBuf;
use std::sync::Arc;

use crate::event::EventSink;

/// Default bucket name used when none is supplied.
pub const DEFAULT_BUCKET: &str = "lockbox";

/// Configuration for opening or creating a [`crate::vault::Vault`].
///
/// `db_path` overrides the default per-bucket database location; tests and
/// embedders that manage their own storage layout set this explicitly.
pub struct VaultConfig {
    pub bucket: String,
    pub db_path: Option<PathBuf>,
    pub sink: Option<Arc<dyn EventSink>>,
    pub iterations: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            db_path: None,
            sink: None,
            iterations: crate::crypto::DEFAULT_ITERATIONS,
        }
    }
}

impl VaultConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    #[must_use]
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Resolves the database path for this configuration: the explicit
    /// `db_path` if set, otherwise `<config dir>/lockbox/<bucket>.sqlite3`.
    pub fn resolve_db_path(&self) -> crate::error::Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let base = dirs::config_dir().ok_or_else(|| {
            crate::error::VaultError::Corrupt("no platform config directory available".into())
        })?;
        let dir = base.join("lockbox");
        std::fs::create_dir_all(&dir)
            .map_err(|e| crate::error::VaultError::Corrupt(format!("creating config dir: {e}")))?;
        Ok(dir.join(format!("{}.sqlite3", self.bucket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bucket_is_lockbox() {
        let cfg = VaultConfig::default();
        assert_eq!(cfg.bucket, "lockbox");
        assert_eq!(cfg.iterations, crate::crypto::DEFAULT_ITERATIONS);
    }

    #[test]
    fn with_db_path_is_used_verbatim() {
        let path = std::env::temp_dir().join("lockbox-config-test.sqlite3");
        let cfg = VaultConfig::new().with_db_path(path.clone());
        assert_eq!(cfg.resolve_db_path().unwrap(), path);
    }
}
