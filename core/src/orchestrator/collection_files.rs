//! Collection-level files: shared folders and loose settings files, outside any book.

use std::{fs, path::Path, time::SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace};

use crate::{
	config::ROOT_FILES_ARCHIVE,
	error::FileIOError,
	message_log::MessageKind,
	repository::{CollectionFiles, RepoError, RepositoryBackend},
};

use super::{SyncReport, TeamCollection, TeamCollectionError};

/// Newest modification time below `path`, `None` if there is nothing there.
fn newest_modification(path: &Path) -> Result<Option<SystemTime>, FileIOError> {
	let metadata = match fs::metadata(path) {
		Ok(metadata) => metadata,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(FileIOError::from((path, e, "reading modification time"))),
	};

	if metadata.is_file() {
		return metadata
			.modified()
			.map(Some)
			.map_err(|e| FileIOError::from((path, e, "reading modification time")));
	}

	let mut newest = None;
	for entry in fs::read_dir(path).map_err(|e| FileIOError::from((path, e, "listing folder")))? {
		let child = entry
			.map_err(|e| FileIOError::from((path, e, "listing folder")))?
			.path();
		newest = newest.max(newest_modification(&child)?);
	}

	Ok(newest)
}

impl<B: RepositoryBackend> TeamCollection<B> {
	fn collection_file_groups(&self) -> Vec<String> {
		self.config
			.collection_folders
			.iter()
			.cloned()
			.chain([ROOT_FILES_ARCHIVE.to_string()])
			.collect()
	}

	fn root_files(&self) -> CollectionFiles<'_> {
		CollectionFiles::RootFiles {
			root: &self.local,
			names: &self.config.collection_root_files,
		}
	}

	fn local_modified(&self, group: &str) -> Result<Option<DateTime<Utc>>, FileIOError> {
		let newest = if group == ROOT_FILES_ARCHIVE {
			let mut newest = None;
			for name in &self.config.collection_root_files {
				newest = newest.max(newest_modification(&self.local.join(name))?);
			}
			newest
		} else {
			newest_modification(&self.local.join(group))?
		};

		Ok(newest.map(DateTime::<Utc>::from))
	}

	fn has_local_files(&self, group: &str) -> bool {
		if group == ROOT_FILES_ARCHIVE {
			self.config
				.collection_root_files
				.iter()
				.any(|name| self.local.join(name).is_file())
		} else {
			self.local.join(group).is_dir()
		}
	}

	fn push_group(&self, group: &str) -> Result<(), TeamCollectionError> {
		let folder = self.local.join(group);
		let source = if group == ROOT_FILES_ARCHIVE {
			self.root_files()
		} else {
			CollectionFiles::Folder(&folder)
		};

		self.backend.put_collection_files(group, source)?;

		if let Some(modified) = self.backend.collection_files_modified(group)? {
			self.update_sync_state(|state| state.record_collection_files(group, modified))?;
		}

		Ok(())
	}

	fn fetch_group(&self, group: &str, remote_modified: DateTime<Utc>) -> Result<(), TeamCollectionError> {
		let folder = self.local.join(group);
		let dest = if group == ROOT_FILES_ARCHIVE {
			self.root_files()
		} else {
			CollectionFiles::Folder(&folder)
		};

		self.backend
			.fetch_collection_files(group, dest)
			.map_err(RepoError::from)?;

		// Unpacked files carry the time of unpacking, which must not look like a local edit
		let synced = remote_modified.max(Utc::now());
		self.update_sync_state(|state| state.record_collection_files(group, synced))?;

		Ok(())
	}

	/// Send every local collection-files group to the repository.
	#[instrument(skip(self), err)]
	pub fn push_collection_files(&self) -> Result<Vec<String>, TeamCollectionError> {
		let mut pushed = vec![];

		for group in self.collection_file_groups() {
			if !self.has_local_files(&group) {
				trace!(%group, "Nothing to share;");
				continue;
			}

			self.push_group(&group)?;
			pushed.push(group);
		}

		Ok(pushed)
	}

	/// Bring collection files up to date in whichever direction changed since the last sync.
	#[instrument(skip(self), err)]
	pub fn sync_collection_files(&self) -> Result<SyncReport, TeamCollectionError> {
		let mut report = SyncReport::default();
		self.sync_collection_files_into(&mut report)?;
		Ok(report)
	}

	pub(super) fn sync_collection_files_into(
		&self,
		report: &mut SyncReport,
	) -> Result<(), TeamCollectionError> {
		for group in self.collection_file_groups() {
			let remote = self.backend.collection_files_modified(&group)?;
			let synced = self.sync_state.lock().collection_files_synced(&group);
			let local = self.local_modified(&group)?;

			match remote {
				Some(remote) if synced.map_or(true, |synced| remote > synced) => {
					debug!(%group, %remote, ?synced, "Collection files changed remotely;");
					self.fetch_group(&group, remote)?;
					self.log(
						MessageKind::NewStuff,
						None,
						format!("'{group}' was updated from the Team Collection"),
					);
					report.collection_files_fetched.push(group);
				}
				Some(_) if local > synced => {
					self.push_group(&group)?;
					report.collection_files_pushed.push(group);
				}
				None if local.is_some() => {
					self.push_group(&group)?;
					report.collection_files_pushed.push(group);
				}
				_ => trace!(%group, "Collection files up to date;"),
			}
		}

		Ok(())
	}

	/// The repository copy of `group` is newer than what we have.
	pub(crate) fn collection_files_changed(&self, group: &str) -> Result<bool, TeamCollectionError> {
		let remote = self.backend.collection_files_modified(group)?;
		let synced = self.sync_state.lock().collection_files_synced(group);

		Ok(match (remote, synced) {
			(Some(remote), Some(synced)) => remote > synced,
			(Some(_), None) => true,
			(None, _) => false,
		})
	}
}
