//! Per-path debouncing of normalized events.
//!
//! A single save touches a file several times (create, write, close, sometimes a
//! rename from a temp name). Each raw event resets that path's deadline; once a path
//! has been quiet for the debounce window its merged event is released.

use std::{
	collections::{hash_map::Entry, HashMap},
	path::PathBuf,
	time::{Duration, Instant},
};

use tracing::trace;

use crate::{FsEvent, FsEventKind};

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
pub const DEFAULT_RECENT_CREATION_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Pending {
	kind: FsEventKind,
	deadline: Instant,
}

#[derive(Debug)]
pub struct Debouncer {
	window: Duration,
	recent_creation_window: Duration,
	pending: HashMap<PathBuf, Pending>,
	recently_created: HashMap<PathBuf, Instant>,
}

impl Default for Debouncer {
	fn default() -> Self {
		Self::new(DEFAULT_DEBOUNCE_WINDOW, DEFAULT_RECENT_CREATION_WINDOW)
	}
}

impl Debouncer {
	#[must_use]
	pub fn new(window: Duration, recent_creation_window: Duration) -> Self {
		Self {
			window,
			recent_creation_window,
			pending: HashMap::new(),
			recently_created: HashMap::new(),
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	pub fn push(&mut self, event: FsEvent, now: Instant) {
		let FsEvent { path, kind } = event;

		match &kind {
			FsEventKind::Created => {
				self.recently_created.insert(path.clone(), now);
			}

			FsEventKind::Removed => {
				if let Some(created_at) = self.recently_created.remove(&path) {
					if now.saturating_duration_since(created_at) <= self.recent_creation_window {
						// A create immediately followed by a delete is a temp file coming
						// and going, not a deletion anybody needs to hear about
						trace!(path = %path.display(), "Dropping delete of recently created file;");
						self.pending.remove(&path);
						return;
					}
				}
			}

			FsEventKind::Renamed { from } => {
				// The source of a rename is gone; whatever we were holding for it is moot
				if let Some(source) = self.pending.remove(from) {
					trace!(from = %from.display(), kind = ?source.kind, "Rename consumed pending source;");
				}
				self.recently_created.remove(from);
			}

			FsEventKind::Modified => {}
		}

		let deadline = now + self.window;

		match self.pending.entry(path) {
			Entry::Occupied(mut entry) => match merge(&entry.get().kind, kind) {
				Some(kind) => {
					let pending = entry.get_mut();
					pending.kind = kind;
					pending.deadline = deadline;
				}
				None => {
					trace!(path = %entry.key().display(), "Created and removed within window;");
					entry.remove();
				}
			},
			Entry::Vacant(entry) => {
				entry.insert(Pending { kind, deadline });
			}
		}
	}

	/// Release every path that has been quiet for the debounce window, oldest first.
	pub fn drain_due(&mut self, now: Instant) -> Vec<FsEvent> {
		let mut due = self
			.pending
			.iter()
			.filter(|(_, pending)| pending.deadline <= now)
			.map(|(path, pending)| (pending.deadline, path.clone()))
			.collect::<Vec<_>>();
		due.sort();

		let recent_creation_window = self.recent_creation_window;
		self.recently_created
			.retain(|_, created_at| now.saturating_duration_since(*created_at) < recent_creation_window);

		due.into_iter()
			.filter_map(|(_, path)| {
				self.pending
					.remove(&path)
					.map(|Pending { kind, .. }| FsEvent { path, kind })
			})
			.collect()
	}

	/// Release everything regardless of deadlines.
	pub fn flush_all(&mut self) -> Vec<FsEvent> {
		let mut pending = self.pending.drain().collect::<Vec<_>>();
		pending.sort_by_key(|(_, pending)| pending.deadline);
		self.recently_created.clear();

		pending
			.into_iter()
			.map(|(path, Pending { kind, .. })| FsEvent { path, kind })
			.collect()
	}

	/// Drop all pending state without releasing it.
	pub fn clear(&mut self) {
		self.pending.clear();
		self.recently_created.clear();
	}
}

/// Combine an already pending kind with a newer one for the same path.
/// `None` means the two cancel out.
fn merge(pending: &FsEventKind, incoming: FsEventKind) -> Option<FsEventKind> {
	use FsEventKind::{Created, Modified, Removed, Renamed};

	match (pending, incoming) {
		(Created, Removed) => None,
		(_, Removed) => Some(Removed),
		(_, Renamed { from }) => Some(Renamed { from }),
		(Created, Created | Modified) => Some(Created),
		(Removed, Created | Modified) => Some(Modified),
		(Renamed { from }, Created | Modified) => Some(Renamed { from: from.clone() }),
		(Modified, Created | Modified) => Some(Modified),
	}
}
