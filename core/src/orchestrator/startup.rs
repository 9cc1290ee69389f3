use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{message_log::MessageKind, repository::RepoError, repository::RepositoryBackend};

use super::{Conflict, LocalRename, TeamCollection, TeamCollectionError};

/// What a startup synchronization did, book by book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
	pub fetched: Vec<String>,
	pub pushed: Vec<String>,
	pub deleted_locally: Vec<String>,
	/// Local folders renamed after their book, as `(old, new)`
	pub renamed: Vec<(String, String)>,
	/// Local copies set aside in the repository's Lost and Found
	pub lost_and_found: Vec<String>,
	pub corrupt: Vec<String>,
	pub conflicts: Vec<(String, Conflict)>,
	pub failed: Vec<(String, String)>,
	pub collection_files_fetched: Vec<String>,
	pub collection_files_pushed: Vec<String>,
}

impl SyncReport {
	#[must_use]
	pub fn is_quiet(&self) -> bool {
		self.fetched.is_empty()
			&& self.pushed.is_empty()
			&& self.deleted_locally.is_empty()
			&& self.renamed.is_empty()
			&& self.lost_and_found.is_empty()
			&& self.corrupt.is_empty()
			&& self.conflicts.is_empty()
			&& self.failed.is_empty()
			&& self.collection_files_fetched.is_empty()
			&& self.collection_files_pushed.is_empty()
	}
}

impl<B: RepositoryBackend> TeamCollection<B> {
	/// Reconcile the local collection with the repository, book by book.
	///
	/// A problem with one book is recorded and the rest carry on. On a first-time join what
	/// we remember of earlier syncs is ignored and every local book is compared by content.
	#[instrument(skip(self), fields(repo = %self.backend.root().display()), err)]
	pub fn sync_at_startup(&self, first_time_join: bool) -> Result<SyncReport, TeamCollectionError> {
		let mut report = SyncReport::default();

		if first_time_join {
			self.update_sync_state(|state| state.clear_books())?;
		}

		let remote = self.backend.list_books()?;
		let mut local = self.local_books()?.into_iter().collect::<BTreeSet<_>>();

		self.follow_remote_renames(&remote, &mut local, &mut report);

		for name in &remote {
			if let Err(e) = self.sync_remote_book(name, local.contains(name), &mut report) {
				self.record_failure(name, &e, &mut report);
			}
		}

		for name in local.iter().filter(|name| !remote.contains(name)) {
			if let Err(e) = self.sync_local_only_book(name, &mut report) {
				self.record_failure(name, &e, &mut report);
			}
		}

		self.sync_collection_files_into(&mut report)?;

		info!(?report, "Startup synchronization finished;");
		Ok(report)
	}

	/// Local books whose archive now lives under another name, matched by version token.
	fn follow_remote_renames(
		&self,
		remote: &[String],
		local: &mut BTreeSet<String>,
		report: &mut SyncReport,
	) {
		let vanished = local
			.iter()
			.filter(|name| !remote.contains(name) && !self.backend.is_known_deleted(name))
			.cloned()
			.collect::<Vec<_>>();

		for old in vanished {
			let Some(synced) = self.synced_book(&old) else {
				continue;
			};

			let Some(new) = remote
				.iter()
				.filter(|name| !local.contains(*name))
				.find(|name| {
					matches!(self.backend.get_status(name),
						Ok(Some(status)) if status.version_token == synced.version_token)
				})
				.cloned()
			else {
				continue;
			};

			match self.follow_rename(&old, &new) {
				Ok(LocalRename::Followed) => {
					local.remove(&old);
					local.insert(new.clone());
					report.renamed.push((old, new));
				}
				Ok(LocalRename::SetAside) => {
					local.remove(&old);
					report.lost_and_found.push(old);
				}
				Ok(LocalRename::Ignored) => {}
				Err(e) => self.record_failure(&old, &e, report),
			}
		}
	}

	fn record_failure(&self, name: &str, e: &TeamCollectionError, report: &mut SyncReport) {
		match e {
			TeamCollectionError::Repo(RepoError::CorruptArchive { .. }) => {
				report.corrupt.push(name.to_string());
				self.log(
					MessageKind::Error,
					Some(name),
					format!("The book could not be read and may be corrupted: {e}"),
				);
			}
			_ => {
				warn!(book = name, ?e, "Failed to synchronize book;");
				report.failed.push((name.to_string(), e.to_string()));
				self.log(MessageKind::Error, Some(name), e.to_string());
			}
		}
	}

	fn sync_remote_book(
		&self,
		name: &str,
		local_exists: bool,
		report: &mut SyncReport,
	) -> Result<(), TeamCollectionError> {
		let Some(status) = self.backend.get_status(name)? else {
			debug!(book = name, "Vanished while synchronizing;");
			return Ok(());
		};

		if !status.belongs_to(&self.config.collection_id) {
			let conflict = Conflict::DifferentCollection {
				expected: self.config.collection_id.clone(),
				found: status.collection_id,
			};
			self.log(MessageKind::Error, Some(name), conflict.to_string());
			report.conflicts.push((name.to_string(), conflict));
			return Ok(());
		}

		if !local_exists {
			self.fetch_book(name)?;
			self.log(MessageKind::NewStuff, Some(name), "New book from the Team Collection");
			report.fetched.push(name.to_string());
			return Ok(());
		}

		let checksum = self.local_checksum(name)?.unwrap_or_default();

		let Some(synced) = self.synced_book(name) else {
			// Never synced here: same content is adopted, anything else is a different book
			if checksum == status.version_token || self.repository_checksum(name)? == checksum {
				let checked_out = self.is_ours(&status);
				self.update_sync_state(|state| {
					state.record_book(name, &status.version_token, checksum, checked_out);
				})?;
			} else {
				self.set_aside_and_fetch(name, report)?;
			}
			return Ok(());
		};

		let remote_changed = status.version_token != synced.version_token;
		let local_modified = checksum != synced.local_checksum;

		match (remote_changed, local_modified) {
			(false, _) => {}
			(true, false) => {
				self.fetch_book(name)?;
				self.log(MessageKind::NewStuff, Some(name), "Updated from the Team Collection");
				report.fetched.push(name.to_string());
			}
			(true, true) => self.set_aside_and_fetch(name, report)?,
		}

		Ok(())
	}

	/// Keep the local copy in Lost and Found, then take the repository version.
	fn set_aside_and_fetch(&self, name: &str, report: &mut SyncReport) -> Result<(), TeamCollectionError> {
		let status = self.new_status();
		let kept = self
			.backend
			.put_book(&self.local_book_path(name), name, &status, true)?;

		self.fetch_book(name)?;

		self.log(
			MessageKind::ClobberPending,
			Some(name),
			format!(
				"Local changes conflicted with the Team Collection and were saved to '{}'",
				kept.display()
			),
		);
		report.lost_and_found.push(name.to_string());
		report.fetched.push(name.to_string());

		Ok(())
	}

	fn sync_local_only_book(&self, name: &str, report: &mut SyncReport) -> Result<(), TeamCollectionError> {
		if self.backend.is_known_deleted(name) {
			if self.synced_version(name).is_some() && !self.is_locally_modified(name)? {
				self.log(MessageKind::NewStuff, Some(name), "Deleted by someone else");
			} else {
				let status = self.new_status();
				let kept = self
					.backend
					.put_book(&self.local_book_path(name), name, &status, true)?;
				self.log(
					MessageKind::ClobberPending,
					Some(name),
					format!(
						"The book was deleted from the Team Collection; the local copy was saved to '{}'",
						kept.display()
					),
				);
				report.lost_and_found.push(name.to_string());
			}

			self.remove_local_book(name)?;
			self.update_sync_state(|state| {
				state.forget_book(name);
			})?;
			report.deleted_locally.push(name.to_string());
			return Ok(());
		}

		// No tombstone: never shared, or lost without a trace. Either way it goes up.
		self.add_book(name)?;
		report.pushed.push(name.to_string());

		Ok(())
	}
}
