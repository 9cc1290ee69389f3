//! Repository backed by a plain shared folder (a synced cloud folder or a LAN share).

use std::{
	fs,
	io::{self, Write},
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::{
	archive::{self, ArchiveError},
	atomic_write::{replace_atomically, write_temp_sibling},
	connection::{self, ConnectionProblem},
	error::FileIOError,
	own_write::{OwnWriteGuard, WriteTracker},
	BookStatus,
};

use super::{
	is_valid_book_name,
	layout::{stem_with_extension, RepoLayout},
	lock_probe::{wait_until_unlocked, LockProbeConfig},
	CollectionFiles, FetchError, JoinFile, RepoError, RepositoryBackend, ARCHIVE_EXTENSION,
};

#[derive(Debug)]
pub struct FolderRepository {
	layout: RepoLayout,
	lock_probe: LockProbeConfig,
	check_sync_agent: bool,
	/// Set while a watcher follows this repository, so it can tell our writes apart.
	tracker: Mutex<Option<WriteTracker>>,
}

impl FolderRepository {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		let root = root.into();
		// Watchers report resolved paths, so the layout has to use them too
		let root = root.canonicalize().unwrap_or(root);

		Self {
			layout: RepoLayout::new(root),
			lock_probe: LockProbeConfig::default(),
			check_sync_agent: true,
			tracker: Mutex::new(None),
		}
	}

	#[must_use]
	pub const fn with_lock_probe(mut self, lock_probe: LockProbeConfig) -> Self {
		self.lock_probe = lock_probe;
		self
	}

	#[must_use]
	pub const fn with_sync_agent_check(mut self, check_sync_agent: bool) -> Self {
		self.check_sync_agent = check_sync_agent;
		self
	}

	#[must_use]
	pub const fn layout(&self) -> &RepoLayout {
		&self.layout
	}

	pub fn set_write_tracker(&self, tracker: Option<WriteTracker>) {
		*self.tracker.lock() = tracker;
	}

	fn track(&self, path: &Path) -> Option<OwnWriteGuard> {
		self.tracker
			.lock()
			.as_ref()
			.map(|tracker| tracker.track(path))
	}

	fn put_lost_and_found(
		&self,
		source: &Path,
		name: &str,
		status: &BookStatus,
	) -> Result<PathBuf, RepoError> {
		let dir = self.layout.lost_and_found_dir();
		fs::create_dir_all(&dir).map_err(|e| FileIOError::from((&dir, e, "creating lost and found")))?;

		let mut temp = write_temp_sibling(&self.layout.lost_and_found_candidate(name, 0), |writer| {
			archive::pack(source, status, writer).map(|_| ())
		})
		.map_err(|e| RepoError::from_archive(name, e))?;

		let mut attempt = 0;
		loop {
			let candidate = self.layout.lost_and_found_candidate(name, attempt);

			match temp.persist_noclobber(&candidate) {
				Ok(_) => {
					info!(book = name, path = %candidate.display(), "Book put in lost and found;");
					return Ok(candidate);
				}
				Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => temp = e.file,
				Err(e) => {
					return Err(FileIOError::from((&candidate, e.error, "writing lost and found")).into())
				}
			}

			attempt += 1;
		}
	}

	fn list_archives(dir: &Path) -> Result<Vec<String>, RepoError> {
		let entries = match fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
			Err(e) => return Err(FileIOError::from((dir, e, "listing archives")).into()),
		};

		let mut names = vec![];
		for entry in entries {
			let path = entry
				.map_err(|e| FileIOError::from((dir, e, "listing archives")))?
				.path();

			if path.is_file() {
				if let Some(name) = stem_with_extension(&path, ARCHIVE_EXTENSION) {
					names.push(name);
				}
			}
		}

		names.sort();
		Ok(names)
	}
}

fn check_name(name: &str) -> Result<(), RepoError> {
	if is_valid_book_name(name) {
		Ok(())
	} else {
		Err(RepoError::InvalidBookName(name.to_string()))
	}
}

fn remove_if_exists(path: &Path, context: &'static str) -> Result<bool, FileIOError> {
	match fs::remove_file(path) {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
		Err(e) => Err(FileIOError::from((path, e, context))),
	}
}

/// Fill a staging folder next to `dest`, then swap it in. `dest` is left alone on failure.
fn replace_folder_with<T>(
	dest: &Path,
	fill: impl FnOnce(&Path) -> Result<T, ArchiveError>,
) -> Result<T, ArchiveError> {
	let parent = dest
		.parent()
		.filter(|parent| !parent.as_os_str().is_empty())
		.unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(parent).map_err(|e| FileIOError::from((parent, e, "creating folder")))?;

	let prefix = format!(
		".{}.",
		dest.file_name().unwrap_or_default().to_string_lossy()
	);
	let staging = tempfile::Builder::new()
		.prefix(&prefix)
		.suffix(".incoming")
		.tempdir_in(parent)
		.map_err(|e| FileIOError::from((parent, e, "creating staging folder")))?;

	let value = fill(staging.path())?;

	if dest.exists() {
		fs::remove_dir_all(dest).map_err(|e| FileIOError::from((dest, e, "removing old folder")))?;
	}
	fs::rename(staging.path(), dest)
		.map_err(|e| FileIOError::from((dest, e, "moving fetched folder into place")))?;

	Ok(value)
}

impl RepositoryBackend for FolderRepository {
	fn root(&self) -> &Path {
		self.layout.root()
	}

	#[instrument(skip(self, source, status), fields(source = %source.display()), err)]
	fn put_book(
		&self,
		source: &Path,
		name: &str,
		status: &BookStatus,
		into_lost_and_found: bool,
	) -> Result<PathBuf, RepoError> {
		check_name(name)?;

		if !source.is_dir() {
			return Err(FileIOError::from((
				source,
				io::Error::new(io::ErrorKind::NotFound, "book folder is missing"),
				"packing book",
			))
			.into());
		}

		if into_lost_and_found {
			return self.put_lost_and_found(source, name, status);
		}

		let books = self.layout.books_dir();
		fs::create_dir_all(&books).map_err(|e| FileIOError::from((&books, e, "creating books folder")))?;

		let dest = self.layout.book_archive(name);
		let _guard = self.track(&dest);

		if dest.exists() {
			wait_until_unlocked(&dest, &self.lock_probe)?;
		}

		// A failed pack drops the temp file, the destination is never half written
		write_temp_sibling(&dest, |writer| {
			archive::pack(source, status, writer).map(|_| ())
		})
		.map_err(|e| RepoError::from_archive(name, e))?
		.persist(&dest)
		.map_err(|e| FileIOError::from((&dest, e.error, "replacing archive")))?;

		let tombstone = self.layout.tombstone(name);
		if remove_if_exists(&tombstone, "removing tombstone")? {
			info!(book = name, "Book recreated, tombstone removed;");
		}

		debug!(book = name, "Book stored;");
		Ok(dest)
	}

	#[instrument(skip(self, dest), fields(dest = %dest.display()))]
	fn fetch_book(&self, name: &str, dest: &Path) -> Result<BookStatus, FetchError> {
		if !is_valid_book_name(name) {
			return Err(FetchError::NotFound(name.to_string()));
		}

		let archive = self.layout.book_archive(name);
		if !archive.is_file() {
			return Err(FetchError::NotFound(name.to_string()));
		}

		replace_folder_with(dest, |staging| archive::unpack_file(&archive, staging))
			.map_err(|e| FetchError::from_archive(name, e))
	}

	#[instrument(skip(self), err)]
	fn delete_book(&self, name: &str, make_tombstone: bool) -> Result<(), RepoError> {
		check_name(name)?;

		let archive = self.layout.book_archive(name);
		{
			let _guard = self.track(&archive);
			if !remove_if_exists(&archive, "deleting archive")? {
				trace!(book = name, "Archive was already gone;");
			}
		}

		if make_tombstone {
			let tombstone = self.layout.tombstone(name);
			let _guard = self.track(&tombstone);

			replace_atomically::<FileIOError>(&tombstone, |writer| {
				writeln!(writer, "deleted {}", Utc::now().to_rfc3339())
					.map_err(|e| FileIOError::from((&tombstone, e, "writing tombstone")))
			})?;
		}

		info!(book = name, make_tombstone, "Book deleted;");
		Ok(())
	}

	fn list_books(&self) -> Result<Vec<String>, RepoError> {
		Self::list_archives(&self.layout.books_dir())
	}

	fn get_status(&self, name: &str) -> Result<Option<BookStatus>, RepoError> {
		check_name(name)?;

		match archive::read_status(&self.layout.book_archive(name)) {
			Ok(status) => Ok(Some(status)),
			Err(ArchiveError::NotFound(_)) => Ok(None),
			Err(e) => Err(RepoError::from_archive(name, e)),
		}
	}

	#[instrument(skip(self, status), err)]
	fn set_status(&self, name: &str, status: &BookStatus) -> Result<(), RepoError> {
		check_name(name)?;

		let dest = self.layout.book_archive(name);
		if !dest.is_file() {
			return Err(RepoError::BookNotFound(name.to_string()));
		}

		let _guard = self.track(&dest);
		wait_until_unlocked(&dest, &self.lock_probe)?;

		archive::write_status(&dest, status).map_err(|e| RepoError::from_archive(name, e))
	}

	fn is_known_deleted(&self, name: &str) -> bool {
		is_valid_book_name(name)
			&& self.layout.tombstone(name).is_file()
			&& !self.layout.book_archive(name).exists()
	}

	fn book_exists(&self, name: &str) -> bool {
		is_valid_book_name(name) && self.layout.book_archive(name).is_file()
	}

	fn list_lost_and_found(&self) -> Result<Vec<String>, RepoError> {
		Self::list_archives(&self.layout.lost_and_found_dir())
	}

	#[instrument(skip(self, source), err)]
	fn put_collection_files(&self, name: &str, source: CollectionFiles<'_>) -> Result<(), RepoError> {
		check_name(name)?;

		let other = self.layout.other_dir();
		fs::create_dir_all(&other).map_err(|e| FileIOError::from((&other, e, "creating other folder")))?;

		let dest = self.layout.collection_archive(name);
		let _guard = self.track(&dest);

		if dest.exists() {
			wait_until_unlocked(&dest, &self.lock_probe)?;
		}

		let status = BookStatus::default();
		replace_atomically::<ArchiveError>(&dest, |writer| {
			match source {
				CollectionFiles::Folder(folder) => archive::pack(folder, &status, writer).map(|_| ()),
				CollectionFiles::RootFiles { root, names } => {
					archive::pack_files(root, names, &status, writer).map(|_| ())
				}
			}
		})
		.map_err(|e| RepoError::from_archive(name, e))?;

		debug!(name, "Collection files stored;");
		Ok(())
	}

	#[instrument(skip(self, dest))]
	fn fetch_collection_files(&self, name: &str, dest: CollectionFiles<'_>) -> Result<(), FetchError> {
		let archive = self.layout.collection_archive(name);
		if !is_valid_book_name(name) || !archive.is_file() {
			return Err(FetchError::NotFound(name.to_string()));
		}

		match dest {
			CollectionFiles::Folder(folder) => {
				replace_folder_with(folder, |staging| archive::unpack_file(&archive, staging))
					.map_err(|e| FetchError::from_archive(name, e))?;
			}

			CollectionFiles::RootFiles { root, names } => {
				let staging = tempfile::Builder::new()
					.prefix(".collection-files.")
					.tempdir_in(root)
					.map_err(|e| FileIOError::from((root, e, "creating staging folder")))?;

				archive::unpack_file(&archive, staging.path())
					.map_err(|e| FetchError::from_archive(name, e))?;

				for file_name in names {
					let fetched = staging.path().join(file_name);
					if fetched.is_file() {
						let target = root.join(file_name);
						fs::rename(&fetched, &target)
							.map_err(|e| FileIOError::from((&target, e, "updating collection file")))?;
					}
				}
			}
		}

		debug!(name, "Collection files fetched;");
		Ok(())
	}

	fn collection_files_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>, RepoError> {
		check_name(name)?;

		let archive = self.layout.collection_archive(name);
		match fs::metadata(&archive).and_then(|metadata| metadata.modified()) {
			Ok(modified) => Ok(Some(modified.into())),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(FileIOError::from((&archive, e, "reading modification time")).into()),
		}
	}

	fn list_collection_files(&self) -> Result<Vec<String>, RepoError> {
		Self::list_archives(&self.layout.other_dir())
	}

	fn write_join_file(&self, join: &JoinFile) -> Result<(), RepoError> {
		let path = self.layout.join_file();
		let _guard = self.track(&path);

		replace_atomically::<FileIOError>(&path, |writer| {
			serde_json::to_writer_pretty(writer, join)
				.map_err(|e| FileIOError::from((&path, io::Error::from(e), "writing join file")))
		})?;

		Ok(())
	}

	fn read_join_file(&self) -> Result<Option<JoinFile>, RepoError> {
		let path = self.layout.join_file();

		let bytes = match fs::read(&path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(FileIOError::from((&path, e, "reading join file")).into()),
		};

		serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|e| FileIOError::from((&path, io::Error::from(e), "parsing join file")).into())
	}

	fn create_layout(&self) -> Result<(), RepoError> {
		for dir in [
			self.layout.books_dir(),
			self.layout.other_dir(),
			self.layout.lost_and_found_dir(),
		] {
			fs::create_dir_all(&dir).map_err(|e| FileIOError::from((&dir, e, "creating repository")))?;
		}

		Ok(())
	}

	fn check_connection(&self) -> Option<ConnectionProblem> {
		connection::check_connection(self.layout.root(), self.check_sync_agent)
	}
}
