//! The Team Collection engine, independent of where the repository lives.

use std::{
	fs,
	path::{Path, PathBuf},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

use crate::{
	archive::book_checksum,
	config::{ConfigError, TeamCollectionConfig},
	error::FileIOError,
	message_log::{CollectionStatus, MessageKind, MessageLog},
	notification::{self, Notification},
	repository::{is_valid_book_name, JoinFile, RepoError, RepositoryBackend},
	sync_state::{SyncState, SyncStateError, SyncedBook},
	BookStatus,
};

mod changes;
mod collection_files;
mod startup;
mod state;

pub use startup::SyncReport;
pub use state::{BookState, Conflict};

const NOTIFICATION_CAPACITY: usize = 64;

/// What became of the local copy when its book was renamed in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalRename {
	Followed,
	SetAside,
	Ignored,
}

#[derive(Error, Debug)]
pub enum TeamCollectionError {
	#[error(transparent)]
	Repo(#[from] RepoError),
	#[error("cannot proceed with '{name}': {conflict}")]
	Conflict { name: String, conflict: Conflict },
	#[error("'{0}' is not checked out here")]
	NotCheckedOut(String),
	#[error("there is no local book '{0}'")]
	LocalBookMissing(String),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	SyncState(#[from] SyncStateError),
	#[error("cannot join: {0}")]
	Join(String),
}

impl TeamCollectionError {
	fn conflict(name: &str, conflict: Conflict) -> Self {
		Self::Conflict {
			name: name.to_string(),
			conflict,
		}
	}
}

/// A local collection folder joined to a repository.
///
/// Every operation blocks on file I/O; from async code run them in `spawn_blocking`.
#[derive(Debug)]
pub struct TeamCollection<B> {
	backend: B,
	local: PathBuf,
	config: TeamCollectionConfig,
	sync_state: Mutex<SyncState>,
	log: Mutex<MessageLog>,
	notifications: broadcast::Sender<Notification>,
}

impl<B: RepositoryBackend> TeamCollection<B> {
	pub fn open(
		local: impl Into<PathBuf>,
		config: TeamCollectionConfig,
		backend: B,
	) -> Result<Self, TeamCollectionError> {
		let local = local.into();
		let sync_state = SyncState::load(&local)?;
		let log = MessageLog::load(&local)?;
		let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

		Ok(Self {
			backend,
			local,
			config,
			sync_state: Mutex::new(sync_state),
			log: Mutex::new(log),
			notifications,
		})
	}

	pub const fn backend(&self) -> &B {
		&self.backend
	}

	pub const fn config(&self) -> &TeamCollectionConfig {
		&self.config
	}

	pub fn local_path(&self) -> &Path {
		&self.local
	}

	pub fn local_book_path(&self, name: &str) -> PathBuf {
		self.local.join(name)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
		self.notifications.subscribe()
	}

	pub fn notify(&self, notification: Notification) {
		notification::send(&self.notifications, notification);
	}

	pub fn collection_status(&self) -> CollectionStatus {
		self.log.lock().collection_status()
	}

	pub fn message_log(&self) -> &Mutex<MessageLog> {
		&self.log
	}

	/// Logging the message is best effort, a full disk must not stop synchronization.
	pub(crate) fn log(&self, kind: MessageKind, book: Option<&str>, text: impl Into<String>) {
		if let Err(e) = self.log.lock().add(kind, book, text) {
			error!(?e, "Failed to write Team Collection message;");
		}
	}

	pub(crate) fn update_sync_state(
		&self,
		update: impl FnOnce(&mut SyncState),
	) -> Result<(), SyncStateError> {
		let mut state = self.sync_state.lock();
		update(&mut state);
		state.save()
	}

	pub(crate) fn synced_book(&self, name: &str) -> Option<SyncedBook> {
		self.sync_state.lock().book(name).cloned()
	}

	pub(crate) fn synced_version(&self, name: &str) -> Option<String> {
		self.sync_state
			.lock()
			.book(name)
			.map(|book| book.version_token.clone())
	}

	pub(crate) fn is_checked_out_here(&self, name: &str) -> bool {
		self.sync_state
			.lock()
			.book(name)
			.is_some_and(|book| book.checked_out)
	}

	pub(crate) fn status_for(&self, name: &str) -> Result<BookStatus, TeamCollectionError> {
		self.backend
			.get_status(name)?
			.ok_or_else(|| RepoError::BookNotFound(name.to_string()).into())
	}

	fn is_ours(&self, status: &BookStatus) -> bool {
		status.is_locked_by(&self.config.user, &self.config.device)
	}

	fn new_status(&self) -> BookStatus {
		BookStatus::new(&self.config.collection_id)
	}

	/// Names of the book folders in the local collection.
	pub fn local_books(&self) -> Result<Vec<String>, TeamCollectionError> {
		let entries = fs::read_dir(&self.local)
			.map_err(|e| FileIOError::from((&self.local, e, "listing local books")))?;

		let mut names = vec![];
		for entry in entries {
			let path = entry
				.map_err(|e| FileIOError::from((&self.local, e, "listing local books")))?
				.path();

			let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
				continue;
			};

			if path.is_dir()
				&& !name.starts_with('.')
				&& is_valid_book_name(name)
				&& !self.config.collection_folders.iter().any(|folder| folder == name)
			{
				names.push(name.to_string());
			}
		}

		names.sort();
		Ok(names)
	}

	pub(crate) fn local_checksum(&self, name: &str) -> Result<Option<String>, TeamCollectionError> {
		let path = self.local_book_path(name);
		if !path.is_dir() {
			return Ok(None);
		}

		Ok(Some(book_checksum(&path)?))
	}

	/// Local content differs from what we last exchanged with the repository.
	pub(crate) fn is_locally_modified(&self, name: &str) -> Result<bool, TeamCollectionError> {
		let Some(checksum) = self.local_checksum(name)? else {
			return Ok(false);
		};

		Ok(!self
			.synced_book(name)
			.is_some_and(|synced| synced.local_checksum == checksum))
	}

	/// Checksum of the repository copy, unpacked aside without touching the local one.
	pub(crate) fn repository_checksum(&self, name: &str) -> Result<String, TeamCollectionError> {
		let scratch = tempfile::tempdir_in(&self.local)
			.map_err(|e| FileIOError::from((&self.local, e, "creating scratch folder")))?;
		let unpacked = scratch.path().join(name);

		self.backend
			.fetch_book(name, &unpacked)
			.map_err(RepoError::from)?;

		Ok(book_checksum(&unpacked)?)
	}

	fn remove_local_book(&self, name: &str) -> Result<(), TeamCollectionError> {
		let path = self.local_book_path(name);
		match fs::remove_dir_all(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(FileIOError::from((&path, e, "removing local book")).into()),
		}
	}

	/// Carry a rename made in the repository over to the local collection.
	///
	/// A local copy with unsent work, or one we hold the lock on, is saved to Lost and Found
	/// instead: no archive under the old name holds it any more.
	pub(crate) fn follow_rename(&self, old: &str, new: &str) -> Result<LocalRename, TeamCollectionError> {
		let old_path = self.local_book_path(old);
		if self.backend.book_exists(old) || !old_path.is_dir() || self.synced_book(old).is_none() {
			return Ok(LocalRename::Ignored);
		}

		let new_path = self.local_book_path(new);
		if !self.is_checked_out_here(old) && !self.is_locally_modified(old)? && !new_path.exists() {
			fs::rename(&old_path, &new_path)
				.map_err(|e| FileIOError::from((&old_path, e, "renaming local book")))?;
			self.update_sync_state(|state| state.rename_book(old, new))?;
			self.log(
				MessageKind::NewStuff,
				Some(new),
				format!("Renamed from '{old}' in the Team Collection"),
			);

			debug!(%old, %new, "Followed rename;");
			return Ok(LocalRename::Followed);
		}

		let kept = self
			.backend
			.put_book(&old_path, old, &self.new_status(), true)?;
		self.remove_local_book(old)?;
		self.update_sync_state(|state| {
			state.forget_book(old);
		})?;
		self.log(
			MessageKind::ClobberPending,
			Some(old),
			format!(
				"The book was renamed to '{new}' in the Team Collection; the local copy was saved to '{}'",
				kept.display()
			),
		);

		Ok(LocalRename::SetAside)
	}

	/// First push of a book that so far only existed here.
	#[instrument(skip(self), err)]
	pub fn add_book(&self, name: &str) -> Result<(), TeamCollectionError> {
		let Some(checksum) = self.local_checksum(name)? else {
			return Err(TeamCollectionError::LocalBookMissing(name.to_string()));
		};

		if self.backend.book_exists(name) {
			return Err(TeamCollectionError::conflict(name, Conflict::NameTaken));
		}

		let status = self.new_status().with_version(&checksum);
		self.backend
			.put_book(&self.local_book_path(name), name, &status, false)?;

		self.update_sync_state(|state| state.record_book(name, &checksum, &checksum, false))?;
		self.log(MessageKind::History, Some(name), "Added to the Team Collection");

		Ok(())
	}

	/// Take the edit lock on a book.
	#[instrument(skip(self), err)]
	pub fn checkout(&self, name: &str) -> Result<(), TeamCollectionError> {
		let status = self.status_for(name)?;

		if !status.belongs_to(&self.config.collection_id) {
			return Err(TeamCollectionError::conflict(
				name,
				Conflict::DifferentCollection {
					expected: self.config.collection_id.clone(),
					found: status.collection_id,
				},
			));
		}

		if status.is_locked_by_other(&self.config.user, &self.config.device) {
			return Err(TeamCollectionError::conflict(
				name,
				Conflict::locked_elsewhere(&status),
			));
		}

		if !self.is_ours(&status) {
			if self.synced_version(name).as_deref() != Some(status.version_token.as_str()) {
				return Err(TeamCollectionError::conflict(name, Conflict::OutOfDate));
			}

			self.backend.set_status(
				name,
				&status.with_lock(&self.config.user, &self.config.device),
			)?;
		}

		self.update_sync_state(|state| state.set_checked_out(name, true))?;
		self.log(MessageKind::History, Some(name), "Checked out");

		Ok(())
	}

	/// Send local changes to the repository, releasing the lock unless `keep_locked`.
	#[instrument(skip(self), err)]
	pub fn check_in(&self, name: &str, keep_locked: bool) -> Result<(), TeamCollectionError> {
		let status = self.status_for(name)?;

		if status.is_locked_by_other(&self.config.user, &self.config.device) {
			return Err(TeamCollectionError::conflict(
				name,
				Conflict::locked_elsewhere(&status),
			));
		}
		if !self.is_ours(&status) {
			return Err(TeamCollectionError::NotCheckedOut(name.to_string()));
		}

		let Some(checksum) = self.local_checksum(name)? else {
			return Err(TeamCollectionError::LocalBookMissing(name.to_string()));
		};

		let unchanged = self.synced_book(name).is_some_and(|synced| {
			synced.local_checksum == checksum && synced.version_token == status.version_token
		});
		let status = if keep_locked { status } else { status.without_lock() };

		let status = if unchanged {
			debug!(book = name, "Content unchanged, only updating status;");
			self.backend.set_status(name, &status)?;
			status
		} else {
			let status = status.with_version(&checksum);
			self.backend
				.put_book(&self.local_book_path(name), name, &status, false)?;
			status
		};

		self.update_sync_state(|state| {
			state.record_book(name, &status.version_token, &checksum, keep_locked);
		})?;
		self.log(MessageKind::History, Some(name), "Checked in");

		Ok(())
	}

	/// Throw away local edits and go back to the repository version.
	#[instrument(skip(self), err)]
	pub fn forget_changes(&self, name: &str) -> Result<(), TeamCollectionError> {
		let status = self.fetch_book(name)?;

		if self.is_ours(&status) {
			self.backend.set_status(name, &status.without_lock())?;
			self.update_sync_state(|state| state.set_checked_out(name, false))?;
		}

		self.log(MessageKind::History, Some(name), "Local changes discarded");
		Ok(())
	}

	/// Give up our lock without sending anything.
	#[instrument(skip(self), err)]
	pub fn release_lock(&self, name: &str) -> Result<(), TeamCollectionError> {
		let status = self.status_for(name)?;
		if !self.is_ours(&status) {
			return Err(TeamCollectionError::NotCheckedOut(name.to_string()));
		}

		self.backend.set_status(name, &status.without_lock())?;
		self.update_sync_state(|state| state.set_checked_out(name, false))?;

		Ok(())
	}

	/// Remove anyone's lock, for when the holder is gone for good.
	#[instrument(skip(self), err)]
	pub fn force_unlock(&self, name: &str) -> Result<(), TeamCollectionError> {
		let status = self.status_for(name)?;
		let Some(holder) = status.locked_by.clone() else {
			return Ok(());
		};

		self.backend.set_status(name, &status.without_lock())?;
		self.update_sync_state(|state| state.set_checked_out(name, false))?;
		self.log(
			MessageKind::Warning,
			Some(name),
			format!("Lock held by {holder} was forcibly removed"),
		);

		Ok(())
	}

	/// Delete a book everywhere; it has to be checked out here first.
	#[instrument(skip(self), err)]
	pub fn delete_book(&self, name: &str) -> Result<(), TeamCollectionError> {
		match self.backend.get_status(name)? {
			Some(status) if status.is_locked_by_other(&self.config.user, &self.config.device) => {
				return Err(TeamCollectionError::conflict(
					name,
					Conflict::locked_elsewhere(&status),
				));
			}
			Some(status) if !self.is_ours(&status) => {
				return Err(TeamCollectionError::NotCheckedOut(name.to_string()));
			}
			Some(_) => self.backend.delete_book(name, true)?,
			None if self.backend.is_known_deleted(name) => {}
			None => return Err(RepoError::BookNotFound(name.to_string()).into()),
		}

		self.remove_local_book(name)?;
		self.update_sync_state(|state| {
			state.forget_book(name);
		})?;
		self.log(MessageKind::History, Some(name), "Deleted");

		Ok(())
	}

	/// Copy the repository version over the local one.
	#[instrument(skip(self), err)]
	pub fn fetch_book(&self, name: &str) -> Result<BookStatus, TeamCollectionError> {
		let status = match self.backend.fetch_book(name, &self.local_book_path(name)) {
			Ok(status) => status,
			Err(e) => {
				let e = RepoError::from(e);
				if let RepoError::CorruptArchive { .. } = e {
					self.log(
						MessageKind::Error,
						Some(name),
						format!("The book could not be read and may be corrupted: {e}"),
					);
				}
				return Err(e.into());
			}
		};

		let checksum = self.local_checksum(name)?.unwrap_or_default();
		let checked_out = self.is_ours(&status);
		self.update_sync_state(|state| {
			state.record_book(name, &status.version_token, checksum, checked_out);
		})?;

		debug!(book = name, "Fetched;");
		Ok(status)
	}

	#[instrument(skip(self), err)]
	pub fn book_state(&self, name: &str) -> Result<BookState, TeamCollectionError> {
		let status = match self.backend.get_status(name) {
			Ok(status) => status,
			Err(RepoError::CorruptArchive { .. }) => return Ok(BookState::Corrupt),
			Err(e) => return Err(e.into()),
		};

		let Some(status) = status else {
			return Ok(if self.backend.is_known_deleted(name) {
				BookState::Deleted
			} else {
				BookState::Untracked
			});
		};

		if !status.belongs_to(&self.config.collection_id) {
			return Ok(BookState::Conflict {
				conflict: Conflict::DifferentCollection {
					expected: self.config.collection_id.clone(),
					found: status.collection_id,
				},
			});
		}

		let Some(synced) = self.synced_version(name) else {
			return Ok(if self.local_book_path(name).is_dir() {
				BookState::Conflict {
					conflict: Conflict::UnsyncedLocalCopy,
				}
			} else {
				BookState::RemoteChanged
			});
		};

		if self.is_ours(&status) {
			return Ok(BookState::CheckedOutHere);
		}

		if status.is_locked() {
			// We believe we hold the lock but someone else does
			if self.is_checked_out_here(name) {
				return Ok(BookState::Conflict {
					conflict: Conflict::locked_elsewhere(&status),
				});
			}

			if status.version_token == synced {
				return Ok(BookState::CheckedOutElsewhere {
					by: status.locked_by.unwrap_or_default(),
					on: status.locked_where,
				});
			}
		}

		Ok(if status.version_token == synced {
			BookState::InSync
		} else {
			BookState::RemoteChanged
		})
	}

	/// Make this local collection the start of a new Team Collection in the repository.
	#[instrument(skip(self), fields(repo = %self.backend.root().display()), err)]
	pub fn share_local_collection(&self) -> Result<Vec<String>, TeamCollectionError> {
		if let Some(existing) = self.backend.read_join_file()? {
			if existing.collection_id != self.config.collection_id {
				return Err(TeamCollectionError::Join(format!(
					"'{}' already holds the Team Collection '{}'",
					self.backend.root().display(),
					existing.collection_name
				)));
			}
		}

		self.backend.create_layout()?;

		let mut shared = vec![];
		for name in self.local_books()? {
			if self.backend.book_exists(&name) {
				debug!(book = %name, "Already shared;");
				continue;
			}

			self.add_book(&name)?;
			shared.push(name);
		}

		self.push_collection_files()?;

		let collection_name = self
			.local
			.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_default();
		self.backend.write_join_file(&JoinFile {
			collection_id: self.config.collection_id.clone(),
			collection_name,
		})?;

		info!(books = shared.len(), "Local collection shared;");
		Ok(shared)
	}
}
