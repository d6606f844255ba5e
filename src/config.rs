//! Per-repository configuration file.

use std::path::Path;

use proxmox_sys::fs::{replace_file, CreateOptions};
use serde::{Deserialize, Serialize};

use skp_api_types::{
    BackupOptions, ScanOptions, SymlinkStrategy, CHUNK_SIZE_DEFAULT,
};
use skp_datastore::{chunker, Error};

pub const CONFIG_FILENAME: &str = "snapkeep.json";

/// Recognized repository options, stored as JSON at the repository
/// root.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RepoConfig {
    /// Fixed chunk size for new backups.
    pub chunk_size: usize,
    pub symlink_strategy: SymlinkStrategy,
    /// Scan dotfiles.
    pub include_hidden: bool,
    /// Verify snapshots after backup and files after restore.
    pub verify_integrity: bool,
    /// Store chunk payloads zstd compressed when that helps.
    pub compress_chunks: bool,
    /// Transport selected for remote operations; opaque to the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE_DEFAULT,
            symlink_strategy: SymlinkStrategy::default(),
            include_hidden: false,
            verify_integrity: false,
            compress_chunks: true,
            transport: None,
        }
    }
}

impl RepoConfig {
    pub fn load(repo_root: &Path) -> Result<Self, Error> {
        let path = repo_root.join(CONFIG_FILENAME);
        let data = std::fs::read(&path)
            .map_err(|err| Error::io_path(format!("unable to read config {path:?}"), err))?;
        let config: RepoConfig = serde_json::from_slice(&data)
            .map_err(|err| Error::InvalidArgument(format!("malformed config {path:?} - {err}")))?;
        chunker::verify_chunk_size(config.chunk_size)?;
        Ok(config)
    }

    pub fn store(&self, repo_root: &Path) -> Result<(), Error> {
        chunker::verify_chunk_size(self.chunk_size)?;
        let path = repo_root.join(CONFIG_FILENAME);
        let mut data = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::InvalidArgument(format!("unable to encode config - {err}")))?;
        data.push(b'\n');
        replace_file(&path, &data, CreateOptions::new(), false)?;
        Ok(())
    }

    /// Backup options seeded from the repository defaults.
    pub fn backup_options(&self, name: impl Into<String>) -> BackupOptions {
        BackupOptions {
            name: name.into(),
            description: None,
            chunk_size: self.chunk_size,
            verify_integrity: self.verify_integrity,
            scan: ScanOptions {
                symlink_strategy: self.symlink_strategy,
                include_hidden: self.include_hidden,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepoConfig {
            chunk_size: 128 * 1024,
            include_hidden: true,
            transport: Some("tcp".into()),
            ..Default::default()
        };
        config.store(dir.path()).unwrap();

        let loaded = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.chunk_size, 128 * 1024);
        assert!(loaded.include_hidden);
        assert_eq!(loaded.transport.as_deref(), Some("tcp"));
    }

    #[test]
    fn unknown_and_missing_fields_get_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            b"{\"include-hidden\": true}",
        )
        .unwrap();
        let loaded = RepoConfig::load(dir.path()).unwrap();
        assert!(loaded.include_hidden);
        assert_eq!(loaded.chunk_size, CHUNK_SIZE_DEFAULT);
    }

    #[test]
    fn out_of_range_chunk_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), b"{\"chunk-size\": 16}").unwrap();
        assert!(matches!(
            RepoConfig::load(dir.path()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn backup_options_inherit_repo_defaults() {
        let config = RepoConfig {
            verify_integrity: true,
            symlink_strategy: SymlinkStrategy::Skip,
            ..Default::default()
        };
        let options = config.backup_options("nightly");
        assert_eq!(options.name, "nightly");
        assert!(options.verify_integrity);
        assert_eq!(options.scan.symlink_strategy, SymlinkStrategy::Skip);
    }
}
