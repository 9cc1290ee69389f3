//! Repository storage: the shared place every member of a collection reads and writes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
	archive::ArchiveError,
	connection::{lock_holder_hint, ConnectionProblem, SyncAgent},
	error::FileIOError,
	BookStatus,
};

mod folder;
mod layout;
mod lock_probe;

pub use folder::FolderRepository;
pub use layout::{
	is_valid_book_name, ChangeKind, RepoChange, RepoLayout, WatchRoot, ARCHIVE_EXTENSION,
	BOOKS_DIR, JOIN_FILE_NAME, LOST_AND_FOUND_DIR, OTHER_DIR, TOMBSTONE_EXTENSION,
};
pub use lock_probe::{wait_until_unlocked, LockProbeConfig};

#[derive(Error, Debug)]
pub enum RepoError {
	#[error("the archive of '{name}' is corrupt: {source}")]
	CorruptArchive {
		name: String,
		#[source]
		source: ArchiveError,
	},
	#[error("'{}' is in use{}", .path.display(), lock_holder_hint(.agent.as_ref()))]
	CannotLock {
		path: Box<Path>,
		agent: Option<SyncAgent>,
	},
	#[error("book '{0}' is not in the repository")]
	BookNotFound(String),
	#[error("'{0}' cannot be used as a book name")]
	InvalidBookName(String),
	#[error("{0}")]
	Connection(ConnectionProblem),

	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl RepoError {
	pub(crate) fn from_archive(name: &str, e: ArchiveError) -> Self {
		match e {
			ArchiveError::NotFound(_) => Self::BookNotFound(name.to_string()),
			ArchiveError::FileIO(e) => Self::FileIO(e),
			e => Self::CorruptArchive {
				name: name.to_string(),
				source: e,
			},
		}
	}
}

/// Why a book could not be copied out of the repository. Corruption is common with
/// half-synced files, so callers report it and carry on.
#[derive(Error, Debug)]
pub enum FetchError {
	#[error("'{0}' is not in the repository")]
	NotFound(String),
	#[error("the archive of '{name}' is corrupt: {source}")]
	Corrupt {
		name: String,
		#[source]
		source: ArchiveError,
	},
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl FetchError {
	pub(crate) fn from_archive(name: &str, e: ArchiveError) -> Self {
		match e {
			ArchiveError::NotFound(_) => Self::NotFound(name.to_string()),
			ArchiveError::FileIO(e) => Self::FileIO(e),
			e => Self::Corrupt {
				name: name.to_string(),
				source: e,
			},
		}
	}
}

impl From<FetchError> for RepoError {
	fn from(e: FetchError) -> Self {
		match e {
			FetchError::NotFound(name) => Self::BookNotFound(name),
			FetchError::Corrupt { name, source } => Self::CorruptArchive { name, source },
			FetchError::FileIO(e) => Self::FileIO(e),
		}
	}
}

/// Local side of a collection-files archive.
#[derive(Debug, Clone, Copy)]
pub enum CollectionFiles<'a> {
	/// A whole folder, replaced as a unit.
	Folder(&'a Path),
	/// Loose files directly in the collection folder.
	RootFiles { root: &'a Path, names: &'a [String] },
}

/// Content of the file new members open to join a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinFile {
	pub collection_id: String,
	pub collection_name: String,
}

/// Storage for one collection.
///
/// All methods block on file I/O, never call them from the watcher task.
pub trait RepositoryBackend: Send + Sync + 'static {
	fn root(&self) -> &Path;

	/// Store `source` as the archive of `name`, returning where it went.
	///
	/// With `into_lost_and_found` a fresh, never overwritten file is created in the lost
	/// and found area instead. Otherwise any tombstone for `name` is removed.
	fn put_book(
		&self,
		source: &Path,
		name: &str,
		status: &BookStatus,
		into_lost_and_found: bool,
	) -> Result<PathBuf, RepoError>;

	/// Replace `dest` with the repository copy of `name`.
	fn fetch_book(&self, name: &str, dest: &Path) -> Result<BookStatus, FetchError>;

	/// Idempotent, a missing archive is not an error.
	fn delete_book(&self, name: &str, make_tombstone: bool) -> Result<(), RepoError>;

	/// Snapshot of the book names; it may be stale by the time it is used.
	fn list_books(&self) -> Result<Vec<String>, RepoError>;

	/// `None` when the book has no archive.
	fn get_status(&self, name: &str) -> Result<Option<BookStatus>, RepoError>;

	fn set_status(&self, name: &str, status: &BookStatus) -> Result<(), RepoError>;

	/// A tombstone and no archive: deleted on purpose, not just missing.
	fn is_known_deleted(&self, name: &str) -> bool;

	fn book_exists(&self, name: &str) -> bool;

	fn list_lost_and_found(&self) -> Result<Vec<String>, RepoError>;

	fn put_collection_files(&self, name: &str, source: CollectionFiles<'_>) -> Result<(), RepoError>;

	fn fetch_collection_files(&self, name: &str, dest: CollectionFiles<'_>) -> Result<(), FetchError>;

	/// Modification time of the collection-files archive `name`, `None` if there is none.
	fn collection_files_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>, RepoError>;

	fn list_collection_files(&self) -> Result<Vec<String>, RepoError>;

	fn write_join_file(&self, join: &JoinFile) -> Result<(), RepoError>;

	fn read_join_file(&self) -> Result<Option<JoinFile>, RepoError>;

	fn create_layout(&self) -> Result<(), RepoError>;

	fn check_connection(&self) -> Option<ConnectionProblem>;
}
