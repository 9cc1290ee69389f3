use tc_fs_watcher::{normalize, Debouncer, FsEvent};

use std::{
	path::Path,
	time::{Duration, Instant},
};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tempfile::{tempdir, TempDir};
use tokio::{fs, sync::mpsc, time::sleep};
use tracing::debug;
use tracing_test::traced_test;

const QUIET: Duration = Duration::from_millis(500);
const GIVE_UP: Duration = Duration::from_secs(5);

fn setup_watcher() -> (
	TempDir,
	RecommendedWatcher,
	mpsc::UnboundedReceiver<notify::Result<Event>>,
) {
	let (events_tx, events_rx) = mpsc::unbounded_channel();

	let watcher = RecommendedWatcher::new(
		move |result| {
			events_tx
				.send(result)
				.expect("Unable to send watcher event");
		},
		Config::default(),
	)
	.expect("Failed to create watcher");

	(tempdir().unwrap(), watcher, events_rx)
}

/// Feed everything the watcher reports into a debouncer until it has been quiet for a while,
/// then release whatever is left.
async fn collect_debounced(
	events_rx: &mut mpsc::UnboundedReceiver<notify::Result<Event>>,
	root: &Path,
) -> Vec<FsEvent> {
	let mut debouncer = Debouncer::default();
	let started = Instant::now();
	let mut last_event_at = Instant::now();

	loop {
		match events_rx.try_recv() {
			Ok(event) => {
				let event = event.expect("watcher error");
				debug!(?event, "Raw event;");
				for fs_event in normalize(&event) {
					debouncer.push(fs_event, Instant::now());
				}
				last_event_at = Instant::now();
			}
			Err(_) => {
				if last_event_at.elapsed() > QUIET || started.elapsed() > GIVE_UP {
					break;
				}
				sleep(Duration::from_millis(20)).await;
			}
		}
	}

	debouncer
		.flush_all()
		.into_iter()
		.filter(|event| event.path.starts_with(root))
		.collect()
}

#[tokio::test]
#[traced_test]
async fn repeated_writes_collapse_to_one_event() {
	let (root_dir, mut watcher, mut events_rx) = setup_watcher();
	let root = root_dir.path().canonicalize().unwrap();

	watcher
		.watch(&root, RecursiveMode::NonRecursive)
		.expect("Failed to watch root directory");

	let file_path = root.join("Frog.archive");
	for i in 0..5 {
		fs::write(&file_path, format!("version {i}")).await.unwrap();
	}

	let events = collect_debounced(&mut events_rx, &root).await;

	assert_eq!(events.len(), 1, "{events:?}");
	assert_eq!(events[0].path, file_path);
	assert!(events[0].is_create(), "{events:?}");

	watcher.unwatch(&root).unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[traced_test]
async fn temp_file_then_rename_is_one_event_on_the_target() {
	let (root_dir, mut watcher, mut events_rx) = setup_watcher();
	let root = root_dir.path().canonicalize().unwrap();

	let target = root.join("Frog.archive");
	fs::write(&target, "old").await.unwrap();

	watcher
		.watch(&root, RecursiveMode::NonRecursive)
		.expect("Failed to watch root directory");

	let temp = root.join("Frog.archive.Ab12.tmp");
	fs::write(&temp, "new").await.unwrap();
	fs::rename(&temp, &target).await.unwrap();

	let events = collect_debounced(&mut events_rx, &root).await;

	assert_eq!(events, vec![FsEvent::rename(&temp, &target)]);

	watcher.unwatch(&root).unwrap();
}

#[tokio::test]
#[traced_test]
async fn removal_of_an_old_file_is_reported() {
	let (root_dir, mut watcher, mut events_rx) = setup_watcher();
	let root = root_dir.path().canonicalize().unwrap();

	let target = root.join("Frog.archive");
	fs::write(&target, "old").await.unwrap();

	watcher
		.watch(&root, RecursiveMode::NonRecursive)
		.expect("Failed to watch root directory");

	fs::remove_file(&target).await.unwrap();

	let events = collect_debounced(&mut events_rx, &root).await;

	assert_eq!(events, vec![FsEvent::remove(&target)]);

	watcher.unwatch(&root).unwrap();
}
