//! A running Team Collection: startup sync, live watching, and connection supervision.

use std::{path::PathBuf, pin::pin, sync::Arc, time::Duration};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use thiserror::Error;
use tokio::{
	spawn,
	sync::broadcast,
	task::{spawn_blocking, JoinError, JoinHandle},
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{
	config::{ConfigError, TeamCollectionConfig},
	message_log::MessageKind,
	notification::Notification,
	orchestrator::{SyncReport, TeamCollection, TeamCollectionError},
	repository::{FolderRepository, RepoChange, RepositoryBackend},
	watcher::{RepoWatcher, WatcherError},
};

pub type FolderTeamCollection = TeamCollection<FolderRepository>;

/// Everything needed to open a collection, passed along explicitly during onboarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinContext {
	pub local_collection: PathBuf,
	pub repo_root: PathBuf,
	/// Adopt the repository's collection instead of merging with what we remember of it
	pub first_time_join: bool,
}

#[derive(Error, Debug)]
pub enum SessionError {
	#[error(transparent)]
	TeamCollection(#[from] TeamCollectionError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Watcher(#[from] WatcherError),
	#[error("background task failed: {0}")]
	Task(#[from] JoinError),
}

#[derive(Debug)]
struct Watching {
	watcher: RepoWatcher,
	processor: JoinHandle<()>,
}

impl Watching {
	fn start(collection: &Arc<FolderTeamCollection>) -> Result<Self, WatcherError> {
		let (watcher, changes_rx) = RepoWatcher::start(
			collection.backend().layout().clone(),
			collection.config().watcher,
		)?;
		collection
			.backend()
			.set_write_tracker(Some(watcher.write_tracker()));

		let processor = spawn(process_changes(Arc::clone(collection), changes_rx).in_current_span());

		Ok(Self { watcher, processor })
	}

	async fn stop(self, collection: &FolderTeamCollection) {
		collection.backend().set_write_tracker(None);
		self.watcher.stop().await;

		// ends once the watcher's change channel is closed
		if let Err(e) = self.processor.await {
			error!(?e, "Failed to join change processing task;");
		}
	}
}

#[derive(Debug)]
pub struct Session {
	collection: Arc<FolderTeamCollection>,
	startup_report: Option<SyncReport>,
	supervisor: Option<JoinHandle<()>>,
	stop_tx: chan::Sender<()>,
}

impl Session {
	#[instrument(skip_all, fields(local = %ctx.local_collection.display(), repo = %ctx.repo_root.display()))]
	pub async fn start(ctx: JoinContext) -> Result<Self, SessionError> {
		let JoinContext {
			local_collection,
			repo_root,
			first_time_join,
		} = ctx;

		let collection = Arc::new(
			spawn_blocking(move || open_collection(local_collection, &repo_root, first_time_join))
				.await??,
		);

		let problem = {
			let collection = Arc::clone(&collection);
			spawn_blocking(move || collection.backend().check_connection()).await?
		};

		let (watching, startup_report) = if let Some(problem) = problem {
			warn!(%problem, "Repository unavailable, waiting for it;");
			collection.log(MessageKind::Disconnected, None, problem.to_string());
			collection.notify(Notification::ConnectionProblem { problem });
			(None, None)
		} else {
			let watching = Watching::start(&collection)?;
			let report = run_sync(&collection, first_time_join).await?;
			(Some(watching), Some(report))
		};

		let (stop_tx, stop_rx) = chan::bounded(1);
		let supervisor = spawn(
			supervise(
				Arc::clone(&collection),
				watching,
				first_time_join && startup_report.is_none(),
				stop_rx,
			)
			.in_current_span(),
		);

		info!("Team Collection session started");

		Ok(Self {
			collection,
			startup_report,
			supervisor: Some(supervisor),
			stop_tx,
		})
	}

	#[must_use]
	pub const fn collection(&self) -> &Arc<FolderTeamCollection> {
		&self.collection
	}

	/// `None` when the repository was unreachable at startup.
	#[must_use]
	pub const fn startup_report(&self) -> Option<&SyncReport> {
		self.startup_report.as_ref()
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
		self.collection.subscribe()
	}

	/// Stops watching; operations in flight run to completion.
	pub async fn stop(mut self) {
		if let Some(supervisor) = self.supervisor.take() {
			if self.stop_tx.send(()).await.is_err() {
				trace!("Session supervisor was already gone");
			}

			if let Err(e) = supervisor.await {
				error!(?e, "Failed to join session supervisor;");
			}
		}
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		if self.supervisor.take().is_some() && self.stop_tx.try_send(()).is_err() {
			trace!("Session supervisor was already gone");
		}
	}
}

fn open_collection(
	local_collection: PathBuf,
	repo_root: &std::path::Path,
	first_time_join: bool,
) -> Result<FolderTeamCollection, SessionError> {
	let mut config = TeamCollectionConfig::load_or_create(&local_collection, repo_root)?;
	if config.repo_root != repo_root {
		info!(from = %config.repo_root.display(), to = %repo_root.display(), "Repository moved;");
		config.repo_root = repo_root.to_path_buf();
		config.save(&local_collection)?;
	}

	if first_time_join {
		let join = FolderRepository::new(repo_root)
			.read_join_file()
			.map_err(TeamCollectionError::from)?
			.ok_or_else(|| {
				TeamCollectionError::Join(format!(
					"no Team Collection found in '{}'",
					repo_root.display()
				))
			})?;

		if join.collection_id != config.collection_id {
			info!(collection = %join.collection_name, "Adopting the repository's collection;");
			config = config.with_collection_id(join.collection_id);
			config.save(&local_collection)?;
		}
	}

	Ok(open_folder_collection(local_collection, config)?)
}

/// Open a collection on the shared-folder backend its settings point at.
pub fn open_folder_collection(
	local_collection: impl Into<PathBuf>,
	config: TeamCollectionConfig,
) -> Result<FolderTeamCollection, TeamCollectionError> {
	let backend = FolderRepository::new(&config.repo_root)
		.with_lock_probe(config.lock_probe)
		.with_sync_agent_check(config.check_sync_agent);

	TeamCollection::open(local_collection, config, backend)
}

async fn run_sync(
	collection: &Arc<FolderTeamCollection>,
	first_time_join: bool,
) -> Result<SyncReport, SessionError> {
	let collection = Arc::clone(collection);
	Ok(spawn_blocking(move || collection.sync_at_startup(first_time_join)).await??)
}

/// Repository I/O never runs on the watcher task; every change goes through the blocking pool.
async fn process_changes(
	collection: Arc<FolderTeamCollection>,
	changes_rx: chan::Receiver<RepoChange>,
) {
	while let Ok(change) = changes_rx.recv().await {
		let handled = {
			let collection = Arc::clone(&collection);
			spawn_blocking(move || collection.handle_repo_change(&change)).await
		};

		match handled {
			Ok(Ok(Some(notification))) => collection.notify(notification),
			Ok(Ok(None)) => {}
			Ok(Err(e)) => error!(?e, "Failed to handle repository change;"),
			Err(e) => error!(?e, "Repository change handler panicked;"),
		}
	}

	debug!("Change processing finished");
}

/// Tells the user about everything a re-scan brought in.
fn notify_report(collection: &FolderTeamCollection, report: &SyncReport) {
	for name in report.fetched.iter().chain(&report.lost_and_found) {
		collection.notify(Notification::BookStateChanged { name: name.clone() });
	}
	for name in &report.deleted_locally {
		collection.notify(Notification::BookDeleted { name: name.clone() });
	}
	for (_, new) in &report.renamed {
		collection.notify(Notification::BookStateChanged { name: new.clone() });
	}
	if !report.collection_files_fetched.is_empty() {
		collection.notify(Notification::CollectionFilesChanged);
	}
}

async fn supervise(
	collection: Arc<FolderTeamCollection>,
	mut watching: Option<Watching>,
	mut first_time_join: bool,
	stop_rx: chan::Receiver<()>,
) {
	enum StreamMessage {
		Check,
		Stop,
	}

	let period = collection
		.config()
		.connection_check_interval()
		.max(Duration::from_millis(100));
	let mut check_interval = interval_at(Instant::now() + period, period);
	check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let mut msg_stream = pin!((
		IntervalStream::new(check_interval).map(|_| StreamMessage::Check),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Check => {
				let problem = {
					let collection = Arc::clone(&collection);
					spawn_blocking(move || collection.backend().check_connection()).await
				};

				let problem = match problem {
					Ok(problem) => problem,
					Err(e) => {
						error!(?e, "Connection check panicked;");
						continue;
					}
				};

				match (problem, watching.take()) {
					(Some(problem), Some(active)) => {
						warn!(%problem, "Lost the repository, pausing;");
						active.stop(&collection).await;
						collection.log(MessageKind::Disconnected, None, problem.to_string());
						collection.notify(Notification::ConnectionProblem { problem });
					}

					(Some(problem), None) => trace!(%problem, "Repository still unavailable;"),

					(None, Some(active)) => watching = Some(active),

					(None, None) => {
						info!("Repository is back, resuming;");
						match Watching::start(&collection) {
							Ok(active) => watching = Some(active),
							Err(e) => {
								error!(?e, "Failed to restart the repository watcher;");
								continue;
							}
						}

						collection.log(MessageKind::Reconnected, None, "The Team Collection is available again");

						match run_sync(&collection, first_time_join).await {
							Ok(report) => {
								first_time_join = false;
								notify_report(&collection, &report);
							}
							Err(e) => error!(?e, "Failed to re-scan the repository;"),
						}
					}
				}
			}

			StreamMessage::Stop => {
				debug!("Stopping Team Collection session");
				break;
			}
		}
	}

	if let Some(active) = watching {
		active.stop(&collection).await;
	}

	info!("Team Collection session gracefully shutdown");
}
