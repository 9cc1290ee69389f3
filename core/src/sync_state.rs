//! What this machine last exchanged with the repository.
//!
//! Without it a client could not tell "the repository copy changed" from "my copy changed",
//! nor "deleted remotely" from "never shared".

use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::{atomic_write::replace_atomically, error::FileIOError};

pub const SYNC_STATE_FILE_NAME: &str = "team-collection-sync.json";

#[derive(Error, Debug)]
pub enum SyncStateError {
	#[error("invalid sync state file: {0}")]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedBook {
	/// Repository version our local copy was last identical to
	pub version_token: String,
	/// Checksum of the local folder right after that sync
	#[serde(default)]
	pub local_checksum: String,
	pub synced_at: DateTime<Utc>,
	/// We hold the lock, so local edits are expected
	#[serde(default)]
	pub checked_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
	#[serde(default)]
	books: BTreeMap<String, SyncedBook>,
	/// Modification time of each collection-files archive when we last synced it
	#[serde(default)]
	collection_files: BTreeMap<String, DateTime<Utc>>,
	#[serde(skip)]
	path: PathBuf,
}

impl SyncState {
	#[must_use]
	pub fn path(local_collection: &Path) -> PathBuf {
		local_collection.join(SYNC_STATE_FILE_NAME)
	}

	/// A missing file is an empty state, as on a first join.
	pub fn load(local_collection: &Path) -> Result<Self, SyncStateError> {
		let path = Self::path(local_collection);

		let mut state: Self = match fs::read(&path) {
			Ok(json) => serde_json::from_slice(&json)?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
			Err(e) => return Err(FileIOError::from((&path, e, "reading sync state")).into()),
		};

		state.path = path;
		Ok(state)
	}

	pub fn save(&self) -> Result<(), SyncStateError> {
		replace_atomically::<SyncStateError>(&self.path, |writer| {
			serde_json::to_writer_pretty(writer, self)?;
			Ok(())
		})?;

		trace!(books = self.books.len(), "Saved sync state");
		Ok(())
	}

	#[must_use]
	pub fn book(&self, name: &str) -> Option<&SyncedBook> {
		self.books.get(name)
	}

	pub fn books(&self) -> impl Iterator<Item = (&str, &SyncedBook)> {
		self.books.iter().map(|(name, book)| (name.as_str(), book))
	}

	pub fn record_book(
		&mut self,
		name: &str,
		version_token: impl Into<String>,
		local_checksum: impl Into<String>,
		checked_out: bool,
	) {
		self.books.insert(
			name.to_string(),
			SyncedBook {
				version_token: version_token.into(),
				local_checksum: local_checksum.into(),
				synced_at: Utc::now(),
				checked_out,
			},
		);
	}

	pub fn set_checked_out(&mut self, name: &str, checked_out: bool) {
		if let Some(book) = self.books.get_mut(name) {
			book.checked_out = checked_out;
		}
	}

	pub fn forget_book(&mut self, name: &str) -> Option<SyncedBook> {
		self.books.remove(name)
	}

	pub fn rename_book(&mut self, old: &str, new: &str) {
		if let Some(book) = self.books.remove(old) {
			self.books.insert(new.to_string(), book);
		}
	}

	/// Forget every book, used when adopting a repository for the first time.
	pub fn clear_books(&mut self) {
		self.books.clear();
	}

	#[must_use]
	pub fn collection_files_synced(&self, name: &str) -> Option<DateTime<Utc>> {
		self.collection_files.get(name).copied()
	}

	pub fn record_collection_files(&mut self, name: &str, modified: DateTime<Utc>) {
		self.collection_files.insert(name.to_string(), modified);
	}
}
