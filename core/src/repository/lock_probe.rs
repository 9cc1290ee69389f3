//! Waiting out other programs that hold an archive open.
//!
//! Sync clients keep files open while they upload or download them. Replacing an archive
//! under their feet either fails or leaves a mangled file, so before rewriting one we try to
//! take an exclusive lock on it, backing off for a bounded number of attempts.

use std::{
	fs::{File, OpenOptions, TryLockError},
	io,
	path::Path,
	thread,
	time::Duration,
};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{connection::SyncAgent, error::FileIOError};

use super::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockProbeConfig {
	pub attempts: u32,
	pub initial_delay_ms: u64,
	pub max_delay_ms: u64,
}

impl Default for LockProbeConfig {
	fn default() -> Self {
		Self {
			attempts: 25,
			initial_delay_ms: 10,
			max_delay_ms: 500,
		}
	}
}

impl LockProbeConfig {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(self.initial_delay_ms))
			.with_max_interval(Duration::from_millis(self.max_delay_ms))
			.with_max_elapsed_time(None)
			.build()
	}
}

enum Probe {
	Free,
	Busy,
}

// ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION
fn is_sharing_violation(e: &io::Error) -> bool {
	matches!(e.raw_os_error(), Some(32 | 33)) && cfg!(windows)
}

fn probe(path: &Path) -> Result<Probe, FileIOError> {
	let file = match OpenOptions::new().read(true).write(true).open(path) {
		Ok(file) => file,
		// nothing there, so nothing to contend with
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Free),
		Err(e) if is_sharing_violation(&e) => return Ok(Probe::Busy),
		Err(e) => return Err(FileIOError::from((path, e, "probing for lock"))),
	};

	try_lock(&file, path)
}

fn try_lock(file: &File, path: &Path) -> Result<Probe, FileIOError> {
	match file.try_lock() {
		// released when `file` is dropped
		Ok(()) => Ok(Probe::Free),
		Err(TryLockError::WouldBlock) => Ok(Probe::Busy),
		Err(TryLockError::Error(e)) if is_sharing_violation(&e) => Ok(Probe::Busy),
		Err(TryLockError::Error(e)) => Err(FileIOError::from((path, e, "probing for lock"))),
	}
}

/// Returns once nobody else holds `path` open, or fails with [`RepoError::CannotLock`].
pub fn wait_until_unlocked(path: &Path, config: &LockProbeConfig) -> Result<(), RepoError> {
	let mut backoff = config.backoff();

	for attempt in 1..=config.attempts.max(1) {
		match probe(path)? {
			Probe::Free => {
				if attempt > 1 {
					debug!(path = %path.display(), attempt, "Archive became available;");
				}
				return Ok(());
			}
			Probe::Busy => {
				let delay = backoff
					.next_backoff()
					.unwrap_or_else(|| Duration::from_millis(config.max_delay_ms));
				trace!(path = %path.display(), attempt, ?delay, "Archive is busy, waiting;");
				if attempt < config.attempts {
					thread::sleep(delay);
				}
			}
		}
	}

	let agent = SyncAgent::guess_for(path);
	warn!(path = %path.display(), ?agent, "Gave up waiting for archive to be released;");

	Err(RepoError::CannotLock {
		path: path.into(),
		agent,
	})
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use std::fs;

	use tempfile::tempdir;

	use super::*;

	const QUICK: LockProbeConfig = LockProbeConfig {
		attempts: 3,
		initial_delay_ms: 1,
		max_delay_ms: 5,
	};

	#[test]
	fn free_and_missing_files_pass() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("Frog.archive");

		wait_until_unlocked(&path, &QUICK).unwrap();

		fs::write(&path, "content").unwrap();
		wait_until_unlocked(&path, &QUICK).unwrap();
	}

	#[test]
	fn held_file_gives_cannot_lock() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("Frog.archive");
		fs::write(&path, "content").unwrap();

		let holder = File::open(&path).unwrap();
		holder.lock().unwrap();

		assert!(matches!(
			wait_until_unlocked(&path, &QUICK),
			Err(RepoError::CannotLock { .. })
		));

		holder.unlock().unwrap();
		wait_until_unlocked(&path, &QUICK).unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "content");
	}
}
