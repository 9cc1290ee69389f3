//! Where things live inside a repository folder, and what a change to a path means.
//!
//! ```text
//! <repo>/Books/<book>.archive
//! <repo>/<book>.tombstone
//! <repo>/Lost and Found/<book>[N].archive
//! <repo>/Other/<collection files>.archive
//! <repo>/Join this Collection.JoinTeamCollection
//! ```

use std::{
	ffi::OsStr,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tc_fs_watcher::{FsEvent, FsEventKind};

pub const BOOKS_DIR: &str = "Books";
pub const OTHER_DIR: &str = "Other";
pub const LOST_AND_FOUND_DIR: &str = "Lost and Found";
pub const ARCHIVE_EXTENSION: &str = "archive";
pub const TOMBSTONE_EXTENSION: &str = "tombstone";
pub const JOIN_FILE_NAME: &str = "Join this Collection.JoinTeamCollection";

/// The directories a watcher follows; each one is debounced on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchRoot {
	Books,
	Other,
	/// The repository folder itself, not recursive, for tombstones.
	Tombstones,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
	Created,
	Changed,
	Deleted,
}

/// A debounced change in the repository, in repository terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoChange {
	Book { name: String, kind: ChangeKind },
	BookRenamed { old: String, new: String },
	CollectionFiles { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
	root: PathBuf,
}

impl RepoLayout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	#[must_use]
	pub fn root(&self) -> &Path {
		&self.root
	}

	#[must_use]
	pub fn books_dir(&self) -> PathBuf {
		self.root.join(BOOKS_DIR)
	}

	#[must_use]
	pub fn other_dir(&self) -> PathBuf {
		self.root.join(OTHER_DIR)
	}

	#[must_use]
	pub fn lost_and_found_dir(&self) -> PathBuf {
		self.root.join(LOST_AND_FOUND_DIR)
	}

	#[must_use]
	pub fn book_archive(&self, name: &str) -> PathBuf {
		self.books_dir().join(with_extension(name, ARCHIVE_EXTENSION))
	}

	#[must_use]
	pub fn tombstone(&self, name: &str) -> PathBuf {
		self.root.join(with_extension(name, TOMBSTONE_EXTENSION))
	}

	#[must_use]
	pub fn collection_archive(&self, name: &str) -> PathBuf {
		self.other_dir().join(with_extension(name, ARCHIVE_EXTENSION))
	}

	/// `<name>.archive`, `<name>1.archive`, `<name>2.archive`...
	#[must_use]
	pub fn lost_and_found_candidate(&self, name: &str, attempt: usize) -> PathBuf {
		let name = if attempt == 0 {
			name.to_string()
		} else {
			format!("{name}{attempt}")
		};

		self.lost_and_found_dir()
			.join(with_extension(&name, ARCHIVE_EXTENSION))
	}

	#[must_use]
	pub fn join_file(&self) -> PathBuf {
		self.root.join(JOIN_FILE_NAME)
	}

	#[must_use]
	pub fn watch_path(&self, root: WatchRoot) -> PathBuf {
		match root {
			WatchRoot::Books => self.books_dir(),
			WatchRoot::Other => self.other_dir(),
			WatchRoot::Tombstones => self.root.clone(),
		}
	}

	/// What a debounced event under `root` means for the collection, if anything.
	#[must_use]
	pub fn classify(&self, root: WatchRoot, event: &FsEvent) -> Option<RepoChange> {
		let watched = self.watch_path(root);
		let name_in_root = |path: &Path, extension: &str| {
			(path.parent() == Some(watched.as_path()))
				.then(|| stem_with_extension(path, extension))
				.flatten()
		};

		match root {
			WatchRoot::Books => {
				let name = name_in_root(&event.path, ARCHIVE_EXTENSION);
				match (&event.kind, name) {
					(FsEventKind::Renamed { from }, Some(new)) => {
						match name_in_root(from, ARCHIVE_EXTENSION) {
							Some(old) if old != new => Some(RepoChange::BookRenamed { old, new }),
							// a temp file renamed over the archive is just a new version
							_ => Some(RepoChange::Book {
								name: new,
								kind: ChangeKind::Changed,
							}),
						}
					}
					(FsEventKind::Renamed { from }, None) => name_in_root(from, ARCHIVE_EXTENSION)
						.map(|name| RepoChange::Book {
							name,
							kind: ChangeKind::Deleted,
						}),
					(kind, Some(name)) => Some(RepoChange::Book {
						name,
						kind: match kind {
							FsEventKind::Created => ChangeKind::Created,
							FsEventKind::Removed => ChangeKind::Deleted,
							_ => ChangeKind::Changed,
						},
					}),
					(_, None) => None,
				}
			}

			WatchRoot::Other => event
				.paths()
				.find_map(|path| name_in_root(path, ARCHIVE_EXTENSION))
				.map(|name| RepoChange::CollectionFiles { name }),

			// Only a tombstone appearing matters; removal means the book came back,
			// which the Books watcher reports on its own
			WatchRoot::Tombstones => match event.kind {
				FsEventKind::Removed => None,
				_ => name_in_root(&event.path, TOMBSTONE_EXTENSION).map(|name| RepoChange::Book {
					name,
					kind: ChangeKind::Deleted,
				}),
			},
		}
	}
}

fn with_extension(name: &str, extension: &str) -> String {
	format!("{name}.{extension}")
}

/// `Frog` for `.../Frog.archive` when the extension matches.
pub(crate) fn stem_with_extension(path: &Path, extension: &str) -> Option<String> {
	if path.extension() != Some(OsStr::new(extension)) {
		return None;
	}

	path.file_stem()
		.and_then(OsStr::to_str)
		.filter(|stem| !stem.is_empty())
		.map(ToString::to_string)
}

/// Book names end up as file names in two folders, so they must be plain names.
#[must_use]
pub fn is_valid_book_name(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& name.trim() == name
		&& !name.contains(['/', '\\', ':', '\0'])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn layout() -> RepoLayout {
		RepoLayout::new("/repo")
	}

	#[test]
	fn paths() {
		let layout = layout();
		assert_eq!(layout.book_archive("Frog"), Path::new("/repo/Books/Frog.archive"));
		assert_eq!(layout.tombstone("Frog"), Path::new("/repo/Frog.tombstone"));
		assert_eq!(
			layout.collection_archive("Allowed Words"),
			Path::new("/repo/Other/Allowed Words.archive")
		);
		assert_eq!(
			layout.lost_and_found_candidate("Frog", 0),
			Path::new("/repo/Lost and Found/Frog.archive")
		);
		assert_eq!(
			layout.lost_and_found_candidate("Frog", 2),
			Path::new("/repo/Lost and Found/Frog2.archive")
		);
	}

	#[test]
	fn book_events() {
		let layout = layout();
		let classify = |event| layout.classify(WatchRoot::Books, &event);

		assert_eq!(
			classify(FsEvent::create("/repo/Books/Frog.archive")),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Created
			})
		);
		assert_eq!(
			classify(FsEvent::modify("/repo/Books/Frog.archive")),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Changed
			})
		);
		assert_eq!(
			classify(FsEvent::remove("/repo/Books/Frog.archive")),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Deleted
			})
		);
		assert_eq!(classify(FsEvent::create("/repo/Books/notes.txt")), None);
		assert_eq!(classify(FsEvent::create("/repo/Books/sub/Frog.archive")), None);
	}

	#[test]
	fn renames() {
		let layout = layout();
		let classify = |event| layout.classify(WatchRoot::Books, &event);

		assert_eq!(
			classify(FsEvent::rename(
				"/repo/Books/Frog.archive.a1b2.tmp",
				"/repo/Books/Frog.archive"
			)),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Changed
			})
		);
		assert_eq!(
			classify(FsEvent::rename("/repo/Books/Frog.archive", "/repo/Books/Toad.archive")),
			Some(RepoChange::BookRenamed {
				old: "Frog".to_string(),
				new: "Toad".to_string()
			})
		);
		assert_eq!(
			classify(FsEvent::rename("/repo/Books/Frog.archive", "/repo/Books/Frog.bak")),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Deleted
			})
		);
	}

	#[test]
	fn collection_files_and_tombstones() {
		let layout = layout();

		assert_eq!(
			layout.classify(
				WatchRoot::Other,
				&FsEvent::modify("/repo/Other/Allowed Words.archive")
			),
			Some(RepoChange::CollectionFiles {
				name: "Allowed Words".to_string()
			})
		);
		assert_eq!(
			layout.classify(
				WatchRoot::Tombstones,
				&FsEvent::create("/repo/Frog.tombstone")
			),
			Some(RepoChange::Book {
				name: "Frog".to_string(),
				kind: ChangeKind::Deleted
			})
		);
		assert_eq!(
			layout.classify(
				WatchRoot::Tombstones,
				&FsEvent::remove("/repo/Frog.tombstone")
			),
			None
		);
		assert_eq!(
			layout.classify(WatchRoot::Tombstones, &FsEvent::create("/repo/Books")),
			None
		);
	}

	#[test]
	fn book_names() {
		assert!(is_valid_book_name("Frog"));
		assert!(is_valid_book_name("The Frog (2nd ed.)"));
		assert!(!is_valid_book_name(""));
		assert!(!is_valid_book_name(".."));
		assert!(!is_valid_book_name("a/b"));
		assert!(!is_valid_book_name(" Frog"));
	}
}
