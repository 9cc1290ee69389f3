use tracing::{debug, instrument, trace, warn};

use crate::{
	message_log::MessageKind,
	notification::Notification,
	repository::{ChangeKind, RepoChange, RepositoryBackend},
};

use super::{Conflict, TeamCollection, TeamCollectionError};

impl<B: RepositoryBackend> TeamCollection<B> {
	/// Turn a change someone else made to the repository into a notification.
	///
	/// Nothing is applied to the local collection here: the user may have unsaved work, so
	/// they decide when to take the new version.
	#[instrument(skip(self), err)]
	pub fn handle_repo_change(
		&self,
		change: &RepoChange,
	) -> Result<Option<Notification>, TeamCollectionError> {
		match change {
			RepoChange::Book {
				name,
				kind: ChangeKind::Created | ChangeKind::Changed,
			} => self.book_appeared_or_changed(name),

			RepoChange::BookRenamed { old, new } => {
				let outcome = self.follow_rename(old, new)?;
				debug!(%old, %new, ?outcome, "Book renamed in the repository;");
				self.book_appeared_or_changed(new)
			}

			RepoChange::Book {
				name,
				kind: ChangeKind::Deleted,
			} => Ok(self.book_removed(name)),

			RepoChange::CollectionFiles { name } => {
				if !self.collection_files_changed(name)? {
					trace!(%name, "Collection files already up to date;");
					return Ok(None);
				}

				self.log(
					MessageKind::NewStuff,
					None,
					format!("'{name}' was changed in the Team Collection"),
				);
				Ok(Some(Notification::CollectionFilesChanged))
			}
		}
	}

	fn book_appeared_or_changed(&self, name: &str) -> Result<Option<Notification>, TeamCollectionError> {
		// Sync clients sometimes report a file that is already gone again
		let Some(status) = self.backend.get_status(name)? else {
			trace!(book = name, "Changed archive is gone already;");
			return Ok(None);
		};

		let known_here =
			self.local_book_path(name).is_dir() || self.synced_version(name).is_some();
		if !known_here {
			self.log(MessageKind::NewStuff, Some(name), "New book in the Team Collection");
			return Ok(Some(Notification::NewBook {
				name: name.to_string(),
			}));
		}

		if !status.belongs_to(&self.config.collection_id) {
			let conflict = Conflict::DifferentCollection {
				expected: self.config.collection_id.clone(),
				found: status.collection_id.clone(),
			};
			warn!(book = name, %conflict, "Conflicting book in the repository;");
			self.log(MessageKind::Error, Some(name), conflict.to_string());
		} else if self.is_checked_out_here(name)
			&& status.is_locked_by_other(&self.config.user, &self.config.device)
		{
			let conflict = Conflict::locked_elsewhere(&status);
			warn!(book = name, %conflict, "Book we hold was locked by someone else;");
			self.log(MessageKind::Error, Some(name), conflict.to_string());
		} else if self.synced_version(name).as_deref() != Some(status.version_token.as_str()) {
			self.log(MessageKind::NewStuff, Some(name), "Changed in the Team Collection");
		}

		Ok(Some(Notification::BookStateChanged {
			name: name.to_string(),
		}))
	}

	fn book_removed(&self, name: &str) -> Option<Notification> {
		if self.backend.is_known_deleted(name) {
			self.log(MessageKind::NewStuff, Some(name), "Deleted from the Team Collection");
			return Some(Notification::BookDeleted {
				name: name.to_string(),
			});
		}

		if self.backend.book_exists(name) {
			return Some(Notification::BookStateChanged {
				name: name.to_string(),
			});
		}

		// No tombstone: a sync client moving things around, not a deletion
		debug!(book = name, "Archive missing without tombstone, ignoring;");
		None
	}
}
