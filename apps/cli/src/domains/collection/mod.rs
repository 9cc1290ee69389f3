use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tc_core::{
	open_folder_collection, CollectionStatus, JoinContext, Notification, RepositoryBackend,
	Session, SyncReport, TeamCollectionConfig, TeamCollectionMessage,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::context::Context;

mod args;

pub use args::{CollectionJoinArgs, CollectionShareArgs, CollectionStatusArgs};

#[derive(Subcommand, Debug)]
pub enum CollectionCommands {
	/// Turn the local collection into a Team Collection in a shared folder
	Share(CollectionShareArgs),
	/// Join the Team Collection in a shared folder
	Join(CollectionJoinArgs),
	/// Synchronize with the Team Collection once
	Sync,
	/// Show the collection status and unread messages
	Status(CollectionStatusArgs),
	/// Stay running and report changes made by others
	Watch,
	/// Check that the shared folder is reachable
	Check,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
	status: CollectionStatus,
	messages: Vec<TeamCollectionMessage>,
}

fn print_report(report: &SyncReport) {
	if report.is_quiet() {
		println!("Everything is up to date");
		return;
	}

	let sections = [
		("Fetched", &report.fetched),
		("Sent", &report.pushed),
		("Removed locally", &report.deleted_locally),
		("Saved to Lost and Found", &report.lost_and_found),
		("Damaged", &report.corrupt),
		("Collection files fetched", &report.collection_files_fetched),
		("Collection files sent", &report.collection_files_pushed),
	];
	for (title, names) in sections {
		if !names.is_empty() {
			println!("{title}: {}", names.join(", "));
		}
	}

	for (old, new) in &report.renamed {
		println!("Renamed: {old} -> {new}");
	}
	for (name, conflict) in &report.conflicts {
		println!("Conflict in '{name}': {conflict}");
	}
	for (name, reason) in &report.failed {
		println!("Failed '{name}': {reason}");
	}
}

fn describe(notification: &Notification) -> String {
	match notification {
		Notification::NewBook { name } => format!("New book: {name}"),
		Notification::BookStateChanged { name } => format!("Changed: {name}"),
		Notification::BookDeleted { name } => format!("Deleted: {name}"),
		Notification::CollectionFilesChanged => "Collection files changed".to_string(),
		Notification::ConnectionProblem { problem } => format!("Connection problem: {problem}"),
	}
}

async fn start_session(ctx: &Context, join: JoinContext) -> Result<Session> {
	let session = Session::start(join).await?;

	match session.startup_report() {
		Some(report) => ctx.print(report, print_report)?,
		None => warn!("The Team Collection is not reachable right now"),
	}

	Ok(session)
}

pub async fn run(ctx: &Context, cmd: CollectionCommands) -> Result<()> {
	match cmd {
		CollectionCommands::Share(CollectionShareArgs { repo }) => {
			let mut config = TeamCollectionConfig::load_or_create(&ctx.collection_dir, &repo)?;
			if config.repo_root != repo {
				config.repo_root = repo;
				config.save(&ctx.collection_dir)?;
			}

			let collection = open_folder_collection(&ctx.collection_dir, config)?;
			let shared = collection.share_local_collection()?;
			ctx.print(&shared, |shared| {
				println!(
					"Shared {} books to '{}'",
					shared.len(),
					collection.backend().root().display()
				);
			})?;
		}

		CollectionCommands::Join(CollectionJoinArgs { repo }) => {
			let session = start_session(
				ctx,
				JoinContext {
					local_collection: ctx.collection_dir.clone(),
					repo_root: repo,
					first_time_join: true,
				},
			)
			.await?;
			session.stop().await;
		}

		CollectionCommands::Sync => {
			let config = ctx.config()?;
			let session = start_session(
				ctx,
				JoinContext {
					local_collection: ctx.collection_dir.clone(),
					repo_root: config.repo_root,
					first_time_join: false,
				},
			)
			.await?;

			let reached = session.startup_report().is_some();
			session.stop().await;
			if !reached {
				bail!("could not reach the Team Collection");
			}
		}

		CollectionCommands::Status(CollectionStatusArgs { mark_seen }) => {
			let collection = ctx.open()?;
			let output = {
				let log = collection.message_log().lock();
				StatusOutput {
					status: log.collection_status(),
					messages: log.unseen().cloned().collect(),
				}
			};

			ctx.print(&output, |output| {
				println!("Status: {:?}", output.status);
				for message in &output.messages {
					match &message.book {
						Some(book) => println!("{} [{book}] {}", message.when, message.text),
						None => println!("{} {}", message.when, message.text),
					}
				}
			})?;

			if mark_seen {
				collection.message_log().lock().mark_seen()?;
			}
		}

		CollectionCommands::Watch => {
			let config = ctx.config()?;
			let session = start_session(
				ctx,
				JoinContext {
					local_collection: ctx.collection_dir.clone(),
					repo_root: config.repo_root,
					first_time_join: false,
				},
			)
			.await?;
			let mut rx = session.subscribe();

			loop {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => break,
					notification = rx.recv() => match notification {
						Ok(notification) => ctx.print(&notification, |n| println!("{}", describe(n)))?,
						Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed some notifications;"),
						Err(RecvError::Closed) => break,
					},
				}
			}

			session.stop().await;
		}

		CollectionCommands::Check => {
			let collection = ctx.open()?;
			let problem = collection.backend().check_connection();
			ctx.print(&problem, |problem| match problem {
				Some(problem) => println!("{problem}"),
				None => println!("The Team Collection is reachable"),
			})?;
		}
	}

	Ok(())
}
