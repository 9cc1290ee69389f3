use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BookStatus;

/// Where a book stands, seen from this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum BookState {
	/// Only exists locally
	Untracked,
	InSync,
	CheckedOutHere,
	CheckedOutElsewhere {
		by: String,
		on: Option<String>,
	},
	/// The repository holds a version we do not have yet
	RemoteChanged,
	/// Deliberately deleted from the repository
	Deleted,
	Conflict {
		conflict: Conflict,
	},
	Corrupt,
}

/// Local and repository disagree in a way only a person can sort out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum Conflict {
	LockedElsewhere {
		by: String,
		on: Option<String>,
		since: Option<DateTime<Utc>>,
	},
	DifferentCollection {
		expected: String,
		found: String,
	},
	/// The repository has a newer version than the local copy
	OutOfDate,
	/// A different book with the same name is already shared
	NameTaken,
	/// A local copy exists that was never synchronized with the repository one
	UnsyncedLocalCopy,
}

impl Conflict {
	pub(crate) fn locked_elsewhere(status: &BookStatus) -> Self {
		Self::LockedElsewhere {
			by: status.locked_by.clone().unwrap_or_default(),
			on: status.locked_where.clone(),
			since: status.locked_when,
		}
	}
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::LockedElsewhere { by, on, .. } => {
				write!(f, "the book is checked out to {by}")?;
				if let Some(on) = on {
					write!(f, " on {on}")?;
				}
				Ok(())
			}
			Self::DifferentCollection { expected, found } => write!(
				f,
				"the book belongs to collection {found}, not to this collection ({expected})"
			),
			Self::OutOfDate => f.write_str("someone else has changed the book since you last got it"),
			Self::NameTaken => f.write_str("a book with this name is already in the Team Collection"),
			Self::UnsyncedLocalCopy => {
				f.write_str("the local copy was never synchronized with the Team Collection")
			}
		}
	}
}
