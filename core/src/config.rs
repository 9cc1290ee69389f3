//! Per-collection Team Collection settings, stored next to the books they govern.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
	atomic_write::replace_atomically, error::FileIOError, repository::LockProbeConfig,
	watcher::WatcherConfig,
};

pub const CONFIG_FILE_NAME: &str = "team-collection.json";
pub const ROOT_FILES_ARCHIVE: &str = "RootFiles";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("no Team Collection settings in '{}'", .0.display())]
	NotFound(Box<Path>),
	#[error("unknown settings version {0}")]
	UnknownVersion(u32),
	#[error("invalid Team Collection settings: {0}")]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamCollectionConfig {
	/// Settings schema version
	pub version: u32,
	pub collection_id: String,
	pub repo_root: PathBuf,

	/// Who we are in lock records
	#[serde(default = "default_user")]
	pub user: String,
	#[serde(default = "default_device")]
	pub device: String,

	#[serde(default)]
	pub watcher: WatcherConfig,
	#[serde(default)]
	pub lock_probe: LockProbeConfig,

	#[serde(default = "default_connection_check_interval_ms")]
	pub connection_check_interval_ms: u64,
	/// Also require the sync client to be running when the repository lives in its folder
	#[serde(default = "default_true")]
	pub check_sync_agent: bool,

	/// Collection folders that are shared as a unit, not as books
	#[serde(default = "default_collection_folders")]
	pub collection_folders: Vec<String>,
	/// Loose files of the collection folder that are shared
	#[serde(default = "default_collection_root_files")]
	pub collection_root_files: Vec<String>,
}

fn default_user() -> String {
	whoami::username()
}

fn default_device() -> String {
	whoami::devicename()
}

const fn default_connection_check_interval_ms() -> u64 {
	10_000
}

const fn default_true() -> bool {
	true
}

fn default_collection_folders() -> Vec<String> {
	vec!["Allowed Words".to_string(), "Sample Texts".to_string()]
}

fn default_collection_root_files() -> Vec<String> {
	vec!["collection-settings.json".to_string()]
}

impl TeamCollectionConfig {
	#[must_use]
	pub fn new(repo_root: impl Into<PathBuf>) -> Self {
		Self {
			version: Self::target_version(),
			collection_id: Uuid::new_v4().to_string(),
			repo_root: repo_root.into(),
			user: default_user(),
			device: default_device(),
			watcher: WatcherConfig::default(),
			lock_probe: LockProbeConfig::default(),
			connection_check_interval_ms: default_connection_check_interval_ms(),
			check_sync_agent: true,
			collection_folders: default_collection_folders(),
			collection_root_files: default_collection_root_files(),
		}
	}

	#[must_use]
	pub fn with_collection_id(self, collection_id: impl Into<String>) -> Self {
		Self {
			collection_id: collection_id.into(),
			..self
		}
	}

	#[must_use]
	pub fn with_identity(self, user: impl Into<String>, device: impl Into<String>) -> Self {
		Self {
			user: user.into(),
			device: device.into(),
			..self
		}
	}

	#[must_use]
	pub fn path(local_collection: &Path) -> PathBuf {
		local_collection.join(CONFIG_FILE_NAME)
	}

	pub fn load_from(local_collection: &Path) -> Result<Self, ConfigError> {
		let path = Self::path(local_collection);

		let json = match fs::read(&path) {
			Ok(json) => json,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(ConfigError::NotFound(path.into()))
			}
			Err(e) => return Err(FileIOError::from((&path, e, "reading settings")).into()),
		};

		let mut config: Self = serde_json::from_slice(&json)?;
		if config.version != Self::target_version() {
			warn!(
				from = config.version,
				to = Self::target_version(),
				"Migrating Team Collection settings;"
			);
			config.migrate()?;
			config.save(local_collection)?;
		}

		Ok(config)
	}

	/// Loads existing settings, or writes fresh ones pointing at `repo_root`.
	pub fn load_or_create(local_collection: &Path, repo_root: &Path) -> Result<Self, ConfigError> {
		match Self::load_from(local_collection) {
			Ok(config) => Ok(config),
			Err(ConfigError::NotFound(_)) => {
				let config = Self::new(repo_root);
				config.save(local_collection)?;
				Ok(config)
			}
			Err(e) => Err(e),
		}
	}

	pub fn save(&self, local_collection: &Path) -> Result<(), ConfigError> {
		fs::create_dir_all(local_collection)
			.map_err(|e| FileIOError::from((local_collection, e, "creating collection folder")))?;

		let path = Self::path(local_collection);
		replace_atomically::<ConfigError>(&path, |writer| {
			serde_json::to_writer_pretty(writer, self)?;
			Ok(())
		})?;

		info!(path = %path.display(), "Saved Team Collection settings");
		Ok(())
	}

	#[must_use]
	pub const fn connection_check_interval(&self) -> Duration {
		Duration::from_millis(self.connection_check_interval_ms)
	}

	const fn target_version() -> u32 {
		1
	}

	fn migrate(&mut self) -> Result<(), ConfigError> {
		match self.version {
			// Unversioned settings only lacked fields that all have defaults
			0 => {
				self.version = 1;
				Ok(())
			}
			1 => Ok(()),
			v => Err(ConfigError::UnknownVersion(v)),
		}
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn create_then_load() {
		let dir = tempdir().unwrap();
		let repo = dir.path().join("repo");

		let created = TeamCollectionConfig::load_or_create(dir.path(), &repo).unwrap();
		assert_eq!(created.repo_root, repo);
		assert_eq!(created.watcher.debounce_window_ms, 100);
		assert_eq!(created.lock_probe.attempts, 25);

		let loaded = TeamCollectionConfig::load_or_create(dir.path(), Path::new("/elsewhere")).unwrap();
		assert_eq!(loaded, created);
	}

	#[test]
	fn minimal_settings_get_defaults() {
		let dir = tempdir().unwrap();
		fs::write(
			TeamCollectionConfig::path(dir.path()),
			r#"{ "version": 0, "collection_id": "abc", "repo_root": "/repo" }"#,
		)
		.unwrap();

		let config = TeamCollectionConfig::load_from(dir.path()).unwrap();
		assert_eq!(config.version, 1);
		assert_eq!(config.collection_id, "abc");
		assert_eq!(config.watcher, WatcherConfig::default());
		assert_eq!(config.collection_folders, ["Allowed Words", "Sample Texts"]);
		assert!(config.check_sync_agent);

		// the migration was persisted
		let raw = fs::read_to_string(TeamCollectionConfig::path(dir.path())).unwrap();
		assert!(raw.contains("\"version\": 1"));
	}

	#[test]
	fn future_versions_are_refused() {
		let dir = tempdir().unwrap();
		fs::write(
			TeamCollectionConfig::path(dir.path()),
			r#"{ "version": 7, "collection_id": "abc", "repo_root": "/repo" }"#,
		)
		.unwrap();

		assert!(matches!(
			TeamCollectionConfig::load_from(dir.path()),
			Err(ConfigError::UnknownVersion(7))
		));
	}

	#[test]
	fn missing_settings() {
		let dir = tempdir().unwrap();
		assert!(matches!(
			TeamCollectionConfig::load_from(dir.path()),
			Err(ConfigError::NotFound(_))
		));
	}
}
