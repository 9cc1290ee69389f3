//! Suppression of our own repository writes in the change stream.
//!
//! Best effort only: a write is "ours" while it is in progress and for a grace window after
//! it finishes, because notifications can arrive after the write call returns. A foreign
//! write landing on the same path inside that window is missed until its next change.

use std::{
	collections::HashMap,
	ffi::OsStr,
	path::{Path, PathBuf},
	time::{Duration, Instant},
};

use async_channel as chan;
use tracing::{error, trace};

use crate::{atomic_write::TEMP_SUFFIX, watcher::WatcherInput};

pub const DEFAULT_OWN_WRITE_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug)]
pub struct OwnWriteFilter {
	grace: Duration,
	/// Nested writes to one path are counted, the path stays ours until the last one ends.
	in_progress: HashMap<PathBuf, usize>,
	finished: HashMap<PathBuf, Instant>,
}

impl Default for OwnWriteFilter {
	fn default() -> Self {
		Self::new(DEFAULT_OWN_WRITE_GRACE)
	}
}

impl OwnWriteFilter {
	#[must_use]
	pub fn new(grace: Duration) -> Self {
		Self {
			grace,
			in_progress: HashMap::new(),
			finished: HashMap::new(),
		}
	}

	pub fn begin(&mut self, path: impl Into<PathBuf>) {
		let path = path.into();
		self.finished.remove(&path);
		*self.in_progress.entry(path).or_default() += 1;
	}

	pub fn finish(&mut self, path: impl AsRef<Path>, now: Instant) {
		let path = path.as_ref();

		match self.in_progress.get_mut(path) {
			Some(count) if *count > 1 => *count -= 1,
			Some(_) => {
				self.in_progress.remove(path);
				self.finished.insert(path.to_path_buf(), now);
			}
			None => trace!(path = %path.display(), "Write finished without having started;"),
		}
	}

	#[must_use]
	pub fn is_own_write(&self, path: &Path, now: Instant) -> bool {
		if is_temp_file(path) {
			return true;
		}

		self.in_progress.keys().any(|ours| matches_write(path, ours))
			|| self.finished.iter().any(|(ours, finished_at)| {
				now.saturating_duration_since(*finished_at) <= self.grace && matches_write(path, ours)
			})
	}

	/// Forget finished writes whose grace window is over.
	pub fn prune(&mut self, now: Instant) {
		let grace = self.grace;
		self.finished
			.retain(|_, finished_at| now.saturating_duration_since(*finished_at) <= grace);
	}
}

fn is_temp_file(path: &Path) -> bool {
	path.file_name()
		.and_then(OsStr::to_str)
		.is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

/// Exact match, or a sibling whose name starts with ours, like the temp files next to it.
fn matches_write(path: &Path, ours: &Path) -> bool {
	if path == ours {
		return true;
	}

	path.parent() == ours.parent()
		&& match (path.file_name(), ours.file_name()) {
			(Some(name), Some(our_name)) => name
				.as_encoded_bytes()
				.starts_with(our_name.as_encoded_bytes()),
			_ => false,
		}
}

/// Handle through which a repository announces its writes to the watcher.
#[derive(Debug, Clone)]
pub struct WriteTracker {
	tx: chan::Sender<WatcherInput>,
}

impl WriteTracker {
	pub(crate) const fn new(tx: chan::Sender<WatcherInput>) -> Self {
		Self { tx }
	}

	/// Marks `path` as being written until the returned guard is dropped.
	#[must_use]
	pub fn track(&self, path: impl Into<PathBuf>) -> OwnWriteGuard {
		let path = path.into();
		send(&self.tx, WatcherInput::WriteStarted(path.clone()));

		OwnWriteGuard {
			tx: self.tx.clone(),
			path,
		}
	}
}

#[derive(Debug)]
pub struct OwnWriteGuard {
	tx: chan::Sender<WatcherInput>,
	path: PathBuf,
}

impl Drop for OwnWriteGuard {
	fn drop(&mut self) {
		send(&self.tx, WatcherInput::WriteFinished(std::mem::take(&mut self.path)));
	}
}

fn send(tx: &chan::Sender<WatcherInput>, input: WatcherInput) {
	// A closed channel only means the watcher is gone, nobody is listening for our writes
	if !tx.is_closed() && tx.try_send(input).is_err() {
		error!("Unable to notify the watcher about a repository write;");
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use super::*;

	const GRACE: Duration = Duration::from_millis(1500);

	fn archive() -> PathBuf {
		PathBuf::from("/repo/Books/Frog.archive")
	}

	#[test]
	fn in_progress_write_is_ours() {
		let mut filter = OwnWriteFilter::new(GRACE);
		let now = Instant::now();

		filter.begin(archive());
		assert!(filter.is_own_write(&archive(), now));
		assert!(filter.is_own_write(&archive(), now + Duration::from_secs(60)));
		assert!(!filter.is_own_write(Path::new("/repo/Books/Toad.archive"), now));
	}

	#[test]
	fn grace_window_after_finish() {
		let mut filter = OwnWriteFilter::new(GRACE);
		let start = Instant::now();

		filter.begin(archive());
		filter.finish(archive(), start);

		assert!(filter.is_own_write(&archive(), start + Duration::from_millis(1000)));
		assert!(!filter.is_own_write(&archive(), start + Duration::from_millis(1600)));

		// pruned entries are gone even for an earlier instant
		filter.prune(start + Duration::from_millis(1600));
		assert!(!filter.is_own_write(&archive(), start + Duration::from_millis(1000)));
	}

	#[test]
	fn sibling_temp_files_match_by_prefix() {
		let mut filter = OwnWriteFilter::new(GRACE);
		let now = Instant::now();

		filter.begin(archive());
		assert!(filter.is_own_write(Path::new("/repo/Books/Frog.archive.x7Gq2.partial"), now));
		// same name, other directory
		assert!(!filter.is_own_write(Path::new("/repo/Other/Frog.archive.x7Gq2.partial"), now));
	}

	#[test]
	fn tmp_files_are_always_ours() {
		let filter = OwnWriteFilter::new(GRACE);
		assert!(filter.is_own_write(Path::new("/repo/Books/Whatever.archive.abc.tmp"), Instant::now()));
		assert!(!filter.is_own_write(Path::new("/repo/Books/Whatever.archive"), Instant::now()));
	}

	#[test]
	fn nested_writes_keep_the_path_until_the_last_ends() {
		let mut filter = OwnWriteFilter::new(GRACE);
		let start = Instant::now();

		filter.begin(archive());
		filter.begin(archive());
		filter.finish(archive(), start);

		let much_later = start + Duration::from_secs(10);
		assert!(filter.is_own_write(&archive(), much_later));

		filter.finish(archive(), much_later);
		assert!(filter.is_own_write(&archive(), much_later + Duration::from_millis(10)));
		assert!(!filter.is_own_write(&archive(), much_later + GRACE * 2));
	}

	#[test]
	fn guard_reports_start_and_finish_in_order() {
		let (tx, rx) = chan::unbounded();
		let tracker = WriteTracker::new(tx);

		{
			let _guard = tracker.track(archive());
		}

		assert!(matches!(rx.try_recv().unwrap(), WatcherInput::WriteStarted(path) if path == archive()));
		assert!(matches!(rx.try_recv().unwrap(), WatcherInput::WriteFinished(path) if path == archive()));
		assert!(rx.try_recv().is_err());
	}
}
