//! Reachability of the shared repository folder.

use std::{
	fmt, fs,
	path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, trace};

/// File sync clients we know how to recognize from a repository path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAgent {
	Dropbox,
	OneDrive,
	GoogleDrive,
}

impl SyncAgent {
	/// Best guess of the sync client managing `path`, from its folder names.
	#[must_use]
	pub fn guess_for(path: &Path) -> Option<Self> {
		path.components().find_map(|component| {
			let Component::Normal(name) = component else {
				return None;
			};

			let name = name.to_string_lossy().to_lowercase();
			if name.starts_with("dropbox") {
				Some(Self::Dropbox)
			} else if name.starts_with("onedrive") {
				Some(Self::OneDrive)
			} else if name.starts_with("google drive")
				|| name.starts_with("googledrive")
				|| name == "my drive"
			{
				Some(Self::GoogleDrive)
			} else {
				None
			}
		})
	}

	const fn process_names(self) -> &'static [&'static str] {
		match self {
			Self::Dropbox => &["dropbox"],
			Self::OneDrive => &["onedrive"],
			Self::GoogleDrive => &["googledrivefs", "googledrivesync", "google drive"],
		}
	}

	/// Whether a process of this client is alive on this machine.
	#[must_use]
	pub fn is_running(self) -> bool {
		let system = System::new_with_specifics(
			RefreshKind::new().with_processes(ProcessRefreshKind::new()),
		);

		let found = system.processes().values().any(|process| {
			let name = process.name().to_string_lossy().to_lowercase();
			self.process_names()
				.iter()
				.any(|candidate| name.starts_with(candidate))
		});

		trace!(agent = %self, found, "Probed sync agent process;");
		found
	}
}

impl fmt::Display for SyncAgent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Dropbox => "Dropbox",
			Self::OneDrive => "OneDrive",
			Self::GoogleDrive => "Google Drive",
		})
	}
}

/// Why the repository cannot be used right now. Meant to be shown to the user as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectionProblem {
	RepositoryMissing { path: PathBuf },
	RepositoryUnreadable { path: PathBuf, reason: String },
	SyncAgentNotRunning { agent: SyncAgent },
}

impl fmt::Display for ConnectionProblem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::RepositoryMissing { path } => write!(
				f,
				"The Team Collection folder '{}' could not be found. \
				Check that the drive or network share is available.",
				path.display()
			),
			Self::RepositoryUnreadable { path, reason } => write!(
				f,
				"The Team Collection folder '{}' could not be read ({reason}).",
				path.display()
			),
			Self::SyncAgentNotRunning { agent } => write!(
				f,
				"The Team Collection folder is synchronized by {agent}, \
				but {agent} does not seem to be running."
			),
		}
	}
}

/// `None` when `root` is usable.
#[must_use]
pub fn check_connection(root: &Path, check_sync_agent: bool) -> Option<ConnectionProblem> {
	match fs::metadata(root) {
		Ok(metadata) if metadata.is_dir() => {}
		Ok(_) => {
			return Some(ConnectionProblem::RepositoryUnreadable {
				path: root.to_path_buf(),
				reason: "not a folder".to_string(),
			})
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			return Some(ConnectionProblem::RepositoryMissing {
				path: root.to_path_buf(),
			})
		}
		Err(e) => {
			return Some(ConnectionProblem::RepositoryUnreadable {
				path: root.to_path_buf(),
				reason: e.to_string(),
			})
		}
	}

	if let Err(e) = fs::read_dir(root) {
		return Some(ConnectionProblem::RepositoryUnreadable {
			path: root.to_path_buf(),
			reason: e.to_string(),
		});
	}

	if check_sync_agent {
		if let Some(agent) = SyncAgent::guess_for(root) {
			if !agent.is_running() {
				debug!(%agent, root = %root.display(), "Sync agent is not running;");
				return Some(ConnectionProblem::SyncAgentNotRunning { agent });
			}
		}
	}

	None
}

/// Tail of a "file is in use" message.
pub(crate) fn lock_holder_hint(agent: Option<&SyncAgent>) -> String {
	agent.map_or_else(
		|| " by another program".to_string(),
		|agent| format!(" (probably by {agent}, try again once it has finished syncing)"),
	)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn sync_agent_from_path() {
		assert_eq!(
			SyncAgent::guess_for(Path::new("/home/alice/Dropbox/Team/Books")),
			Some(SyncAgent::Dropbox)
		);
		assert_eq!(
			SyncAgent::guess_for(Path::new("/Users/bob/OneDrive - SIL/Team")),
			Some(SyncAgent::OneDrive)
		);
		#[cfg(windows)]
		assert_eq!(
			SyncAgent::guess_for(Path::new("C:\\Users\\bob\\OneDrive - SIL\\Team")),
			Some(SyncAgent::OneDrive)
		);
		assert_eq!(
			SyncAgent::guess_for(Path::new("/Volumes/GoogleDrive/My Drive/Team")),
			Some(SyncAgent::GoogleDrive)
		);
		assert_eq!(SyncAgent::guess_for(Path::new("/mnt/share/Team")), None);
	}

	#[test]
	fn missing_repository_is_reported() {
		let dir = tempdir().unwrap();
		let root = dir.path().join("gone");

		assert_eq!(
			check_connection(&root, false),
			Some(ConnectionProblem::RepositoryMissing { path: root })
		);
	}

	#[test]
	fn file_instead_of_folder_is_unreadable() {
		let dir = tempdir().unwrap();
		let root = dir.path().join("file");
		fs::write(&root, "").unwrap();

		assert!(matches!(
			check_connection(&root, false),
			Some(ConnectionProblem::RepositoryUnreadable { .. })
		));
	}

	#[test]
	fn plain_folder_is_fine() {
		let dir = tempdir().unwrap();
		assert_eq!(check_connection(dir.path(), true), None);
	}
}
