use std::collections::BTreeSet;

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tc_core::{BookState, FolderTeamCollection, RepositoryBackend};

use crate::context::Context;

mod args;

pub use args::{BookArgs, BookCheckInArgs, BookUnlockArgs};

#[derive(Subcommand, Debug)]
pub enum BookCommands {
	/// List local and shared books with their state
	List,
	/// Show the state of one book
	State(BookArgs),
	/// Share a book that so far only exists locally
	Add(BookArgs),
	/// Take the edit lock on a book
	Checkout(BookArgs),
	/// Send local changes to the Team Collection
	Checkin(BookCheckInArgs),
	/// Replace the local copy with the shared version
	Fetch(BookArgs),
	/// Discard local changes and release the lock
	Forget(BookArgs),
	/// Release a lock without sending changes
	Unlock(BookUnlockArgs),
	/// Delete a checked out book everywhere
	Delete(BookArgs),
}

#[derive(Debug, Serialize)]
struct BookRow {
	name: String,
	#[serde(flatten)]
	state: BookState,
}

fn describe(state: &BookState) -> String {
	match state {
		BookState::Untracked => "only here".to_string(),
		BookState::InSync => "up to date".to_string(),
		BookState::CheckedOutHere => "checked out to you".to_string(),
		BookState::CheckedOutElsewhere { by, on } => match on {
			Some(on) => format!("checked out to {by} on {on}"),
			None => format!("checked out to {by}"),
		},
		BookState::RemoteChanged => "newer version available".to_string(),
		BookState::Deleted => "deleted".to_string(),
		BookState::Conflict { conflict } => format!("conflict: {conflict}"),
		BookState::Corrupt => "damaged in the Team Collection".to_string(),
	}
}

/// Result of a command that changed a book, with the state it left the book in.
#[derive(Debug, Serialize)]
struct BookOutcome {
	name: String,
	action: &'static str,
	#[serde(flatten)]
	state: BookState,
}

fn print_outcome(
	ctx: &Context,
	collection: &FolderTeamCollection,
	name: String,
	action: &'static str,
	message: &str,
) -> Result<()> {
	let outcome = BookOutcome {
		state: collection.book_state(&name)?,
		name,
		action,
	};

	ctx.print(&outcome, |outcome| {
		println!("{}: {message} ({})", outcome.name, describe(&outcome.state));
	})
}

pub fn run(ctx: &Context, cmd: BookCommands) -> Result<()> {
	let collection = ctx.open()?;

	match cmd {
		BookCommands::List => {
			let mut names = collection
				.local_books()?
				.into_iter()
				.collect::<BTreeSet<_>>();
			names.extend(collection.backend().list_books()?);

			let rows = names
				.into_iter()
				.map(|name| {
					let state = collection.book_state(&name)?;
					Ok(BookRow { name, state })
				})
				.collect::<Result<Vec<_>>>()?;

			ctx.print(&rows, |rows| {
				if rows.is_empty() {
					println!("No books found");
				}
				for row in rows {
					println!("- {} ({})", row.name, describe(&row.state));
				}
			})?;
		}

		BookCommands::State(BookArgs { name }) => {
			let row = BookRow {
				state: collection.book_state(&name)?,
				name,
			};
			ctx.print(&row, |row| println!("{}: {}", row.name, describe(&row.state)))?;
		}

		BookCommands::Add(BookArgs { name }) => {
			collection.add_book(&name)?;
			print_outcome(ctx, &collection, name, "added", "Added to the Team Collection")?;
		}

		BookCommands::Checkout(BookArgs { name }) => {
			collection.checkout(&name)?;
			print_outcome(ctx, &collection, name, "checked_out", "Checked out")?;
		}

		BookCommands::Checkin(BookCheckInArgs { name, keep_locked }) => {
			collection.check_in(&name, keep_locked)?;
			if keep_locked {
				print_outcome(
					ctx,
					&collection,
					name,
					"sent",
					"Sent changes, still checked out to you",
				)?;
			} else {
				print_outcome(ctx, &collection, name, "checked_in", "Checked in")?;
			}
		}

		BookCommands::Fetch(BookArgs { name }) => {
			let status = collection.fetch_book(&name)?;
			ctx.print(&status, |_| println!("Fetched '{name}'"))?;
		}

		BookCommands::Forget(BookArgs { name }) => {
			collection.forget_changes(&name)?;
			print_outcome(ctx, &collection, name, "forgotten", "Discarded local changes")?;
		}

		BookCommands::Unlock(BookUnlockArgs { name, force }) => {
			if force {
				collection.force_unlock(&name)?;
			} else {
				collection.release_lock(&name)?;
			}
			print_outcome(ctx, &collection, name, "unlocked", "Unlocked")?;
		}

		BookCommands::Delete(BookArgs { name }) => {
			collection.delete_book(&name)?;
			print_outcome(ctx, &collection, name, "deleted", "Deleted")?;
		}
	}

	Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn outcomes_serialize_with_the_resulting_state() {
		let outcome = BookOutcome {
			name: "Frog".to_string(),
			action: "checked_out",
			state: BookState::CheckedOutHere,
		};

		assert_eq!(
			serde_json::to_value(&outcome).unwrap(),
			json!({ "name": "Frog", "action": "checked_out", "state": "checkedOutHere" })
		);
	}
}
