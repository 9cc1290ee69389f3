//! Repository change watcher.
//!
//! One task owns every piece of mutable watcher state: a debouncer per watched root and the
//! own-write filter. Raw `notify` events and the repository's write marks reach it through the
//! same FIFO channel, so a write mark is always seen before the events that write causes.

use std::{
	fs,
	path::PathBuf,
	pin::pin,
	time::{Duration, Instant},
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tc_fs_watcher::{normalize, Debouncer};
use thiserror::Error;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval_at, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{
	error::FileIOError,
	own_write::{OwnWriteFilter, WriteTracker},
	repository::{RepoChange, RepoLayout, WatchRoot},
};

const FIFTY_MILLIS: Duration = Duration::from_millis(50);

const WATCH_ROOTS: [WatchRoot; 3] = [WatchRoot::Books, WatchRoot::Other, WatchRoot::Tombstones];

/// Timing windows of the watcher. Slow sync clients may need them stretched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
	pub debounce_window_ms: u64,
	pub recent_creation_window_ms: u64,
	pub own_write_grace_ms: u64,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			debounce_window_ms: 100,
			recent_creation_window_ms: 1000,
			own_write_grace_ms: 1500,
		}
	}
}

impl WatcherConfig {
	fn debouncer(&self) -> Debouncer {
		Debouncer::new(
			Duration::from_millis(self.debounce_window_ms),
			Duration::from_millis(self.recent_creation_window_ms),
		)
	}

	fn own_write_filter(&self) -> OwnWriteFilter {
		OwnWriteFilter::new(Duration::from_millis(self.own_write_grace_ms))
	}
}

#[derive(Error, Debug)]
pub enum WatcherError {
	#[error("repository folder '{}' is not available", .0.display())]
	RootMissing(PathBuf),
	#[error("failed to watch the repository: {0}")]
	Notify(#[from] notify::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

#[derive(Debug)]
pub(crate) enum WatcherInput {
	Raw {
		root: WatchRoot,
		result: notify::Result<Event>,
	},
	WriteStarted(PathBuf),
	WriteFinished(PathBuf),
}

#[derive(Debug)]
pub struct RepoWatcher {
	layout: RepoLayout,
	watchers: Vec<RecommendedWatcher>,
	input_tx: chan::Sender<WatcherInput>,
	handle: Option<JoinHandle<()>>,
	stop_tx: chan::Sender<()>,
}

impl RepoWatcher {
	/// Starts watching; must be called from within a tokio runtime.
	#[instrument(name = "repo_watcher", skip_all, fields(root = %layout.root().display()))]
	pub fn start(
		layout: RepoLayout,
		config: WatcherConfig,
	) -> Result<(Self, chan::Receiver<RepoChange>), WatcherError> {
		if !layout.root().is_dir() {
			return Err(WatcherError::RootMissing(layout.root().to_path_buf()));
		}

		for dir in [layout.books_dir(), layout.other_dir()] {
			fs::create_dir_all(&dir)
				.map_err(|e| FileIOError::from((&dir, e, "creating watched folder")))?;
		}

		let (input_tx, input_rx) = chan::unbounded();
		let (changes_tx, changes_rx) = chan::unbounded();
		let (stop_tx, stop_rx) = chan::bounded(1);

		let watchers = WATCH_ROOTS
			.into_iter()
			.map(|root| -> Result<RecommendedWatcher, WatcherError> {
				let events_tx = input_tx.clone();
				let mut watcher = RecommendedWatcher::new(
					move |result| {
						if !events_tx.is_closed() {
							// SAFETY: we are not blocking the thread as this is an unbounded channel
							if events_tx
								.send_blocking(WatcherInput::Raw { root, result })
								.is_err()
							{
								error!(?root, "Unable to send watcher event to repository watcher;");
							}
						} else {
							error!(?root, "Tried to send file system events to a closed channel;");
						}
					},
					Config::default(),
				)?;

				watcher.watch(&layout.watch_path(root), RecursiveMode::NonRecursive)?;
				trace!(?root, "Now watching");

				Ok(watcher)
			})
			.collect::<Result<Vec<_>, _>>()?;

		let handle = spawn({
			let layout = layout.clone();
			async move {
				while let Err(e) = spawn(
					Self::handle_inputs(
						layout.clone(),
						config,
						input_rx.clone(),
						stop_rx.clone(),
						changes_tx.clone(),
					)
					.in_current_span(),
				)
				.await
				{
					if e.is_panic() {
						error!(?e, "Repository watcher panicked;");
					} else {
						trace!("Repository watcher received shutdown signal and will exit...");
						break;
					}
					trace!("Restarting repository watcher processing task...");
				}

				info!("Repository watcher gracefully shutdown");
			}
			.in_current_span()
		});

		Ok((
			Self {
				layout,
				watchers,
				input_tx,
				handle: Some(handle),
				stop_tx,
			},
			changes_rx,
		))
	}

	async fn handle_inputs(
		layout: RepoLayout,
		config: WatcherConfig,
		input_rx: chan::Receiver<WatcherInput>,
		stop_rx: chan::Receiver<()>,
		changes_tx: chan::Sender<RepoChange>,
	) {
		enum StreamMessage {
			Input(WatcherInput),
			Tick,
			Stop,
		}

		let mut debouncers = WATCH_ROOTS.map(|root| (root, config.debouncer()));
		let mut own_writes = config.own_write_filter();

		let mut tick_interval =
			interval_at(tokio::time::Instant::now() + FIFTY_MILLIS, FIFTY_MILLIS);
		tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut msg_stream = pin!((
			input_rx.map(StreamMessage::Input),
			IntervalStream::new(tick_interval).map(|_| StreamMessage::Tick),
			stop_rx.map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Input(WatcherInput::Raw {
					root,
					result: Ok(event),
				}) => {
					let now = Instant::now();
					let Some((_, debouncer)) = debouncers.iter_mut().find(|(r, _)| *r == root) else {
						continue;
					};

					for event in normalize(&event) {
						// renames are judged by their destination, a foreign
						// save through a temp file must still get through
						if own_writes.is_own_write(&event.path, now) {
							trace!(?event, "Ignoring our own write;");
							continue;
						}

						debouncer.push(event, now);
					}
				}

				StreamMessage::Input(WatcherInput::Raw {
					root,
					result: Err(e),
				}) => error!(?root, ?e, "Repository watcher error;"),

				StreamMessage::Input(WatcherInput::WriteStarted(path)) => own_writes.begin(path),

				StreamMessage::Input(WatcherInput::WriteFinished(path)) => {
					own_writes.finish(path, Instant::now());
				}

				StreamMessage::Tick => {
					let now = Instant::now();
					own_writes.prune(now);

					for (root, debouncer) in &mut debouncers {
						for event in debouncer.drain_due(now) {
							let Some(change) = layout.classify(*root, &event) else {
								trace!(?event, "Ignoring unrelated change;");
								continue;
							};

							debug!(?change, "Repository changed;");
							if changes_tx.send(change).await.is_err() {
								warn!("Nobody is listening to repository changes anymore;");
								return;
							}
						}
					}
				}

				StreamMessage::Stop => {
					debug!("Stopping repository watcher event handler");
					break;
				}
			}
		}
	}

	/// Handle for the repository to announce its own writes.
	#[must_use]
	pub fn write_tracker(&self) -> WriteTracker {
		WriteTracker::new(self.input_tx.clone())
	}

	#[must_use]
	pub const fn layout(&self) -> &RepoLayout {
		&self.layout
	}

	/// Unregisters the file system watchers and drops pending events.
	#[instrument(skip(self), fields(root = %self.layout.root().display()))]
	pub async fn stop(mut self) {
		self.watchers.clear();

		if let Some(handle) = self.handle.take() {
			if self.stop_tx.send(()).await.is_err() {
				trace!("Repository watcher task was already gone");
			}

			if let Err(e) = handle.await {
				error!(?e, "Failed to join repository watcher task;");
			}
		}
	}
}

impl Drop for RepoWatcher {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			let stop_tx = self.stop_tx.clone();

			match tokio::runtime::Handle::try_current() {
				Ok(runtime) => {
					runtime.spawn(async move {
						if stop_tx.send(()).await.is_err() {
							trace!("Repository watcher task was already gone");
						}

						if let Err(e) = handle.await {
							error!(?e, "Failed to join repository watcher task;");
						}
					});
				}
				Err(_) => handle.abort(),
			}
		}
	}
}
