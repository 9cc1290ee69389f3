//! Normalized filesystem events.
//!
//! Every platform reports the same logical operation with a different burst of
//! `notify` events (see the table at the bottom of this file). [`normalize`] folds
//! them into four kinds, leaving the coalescing to the [`Debouncer`](crate::Debouncer).

use std::path::{Path, PathBuf};

use notify::{
	event::{AccessKind, AccessMode, ModifyKind, RenameMode},
	Event, EventKind,
};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEventKind {
	Created,
	Modified,
	Removed,
	/// The event path is the destination; `from` is where the file used to live.
	Renamed { from: PathBuf },
}

/// One logical change to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
	pub path: PathBuf,
	pub kind: FsEventKind,
}

impl FsEvent {
	pub fn create(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			kind: FsEventKind::Created,
		}
	}

	pub fn modify(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			kind: FsEventKind::Modified,
		}
	}

	pub fn remove(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			kind: FsEventKind::Removed,
		}
	}

	pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
		Self {
			path: to.into(),
			kind: FsEventKind::Renamed { from: from.into() },
		}
	}

	#[must_use]
	pub const fn is_create(&self) -> bool {
		matches!(self.kind, FsEventKind::Created)
	}

	#[must_use]
	pub const fn is_modify(&self) -> bool {
		matches!(self.kind, FsEventKind::Modified)
	}

	/// Every path this event touches, destination first.
	pub fn paths(&self) -> impl Iterator<Item = &Path> {
		let from = match &self.kind {
			FsEventKind::Renamed { from } => Some(from.as_path()),
			_ => None,
		};

		std::iter::once(self.path.as_path()).chain(from)
	}
}

/// Translate one raw `notify` event into zero or more normalized events.
#[must_use]
pub fn normalize(event: &Event) -> Vec<FsEvent> {
	let Some(first) = event.paths.first() else {
		return vec![];
	};

	match event.kind {
		EventKind::Create(_) => vec![FsEvent::create(first)],

		// inotify reports the end of a write as a close in write mode
		EventKind::Access(AccessKind::Close(AccessMode::Write)) => vec![FsEvent::modify(first)],

		EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => vec![FsEvent::modify(first)],

		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.get(1) {
			Some(to) => vec![FsEvent::rename(first, to)],
			None => vec![FsEvent::modify(first)],
		},

		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![FsEvent::remove(first)],

		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![FsEvent::create(first)],

		// FSEvents only says "something was renamed here", so we look at the disk
		EventKind::Modify(ModifyKind::Name(_)) => {
			if first.exists() {
				vec![FsEvent::create(first)]
			} else {
				vec![FsEvent::remove(first)]
			}
		}

		EventKind::Remove(_) => vec![FsEvent::remove(first)],

		ref other => {
			trace!(?other, path = %first.display(), "Ignoring event kind;");
			vec![]
		}
	}
}

/***************************************************************************************************
* Raw notify events for the operations we care about:                                             *
*   Linux:   write        -> Create(File), Modify(Data), Access(Close(Write))                     *
*            temp+rename  -> Create(File) tmp, ..., Name(From) tmp, Name(To) dst, Name(Both)      *
*            delete       -> Remove(File)                                                         *
*   MacOS:   write        -> Create(File), Modify(Data(Content))                                  *
*            rename       -> Name(Any) for each side                                              *
*   Windows: write        -> Create(Any), Modify(Any)                                             *
*            rename       -> Name(From), Name(To)                                                 *
***************************************************************************************************/
