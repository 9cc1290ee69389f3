mod helpers;

use std::time::Duration;

use async_channel as chan;
use helpers::{make_book, repository};
use tc_core::{
	BookStatus, ChangeKind, RepoChange, RepoWatcher, RepositoryBackend, WatcherConfig,
};
use tempfile::tempdir;
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

const QUIET: Duration = Duration::from_millis(1000);
const GIVE_UP: Duration = Duration::from_secs(5);

const CONFIG: WatcherConfig = WatcherConfig {
	debounce_window_ms: 100,
	recent_creation_window_ms: 1000,
	own_write_grace_ms: 300,
};

/// Next change for `name`, skipping anything about other books.
async fn change_for(rx: &chan::Receiver<RepoChange>, name: &str) -> Option<ChangeKind> {
	timeout(GIVE_UP, async {
		while let Ok(change) = rx.recv().await {
			match change {
				RepoChange::Book { name: changed, kind } if changed == name => return Some(kind),
				other => tracing::debug!(?other, "Skipping change;"),
			}
		}
		None
	})
	.await
	.ok()
	.flatten()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn own_writes_stay_quiet_foreign_ones_do_not() {
	let local = tempdir().unwrap();
	let repo_dir = tempdir().unwrap();

	let ours = repository(repo_dir.path());
	ours.create_layout().unwrap();

	let (watcher, changes_rx) = RepoWatcher::start(ours.layout().clone(), CONFIG).unwrap();
	ours.set_write_tracker(Some(watcher.write_tracker()));

	let frog = make_book(local.path(), "Frog", "ribbit");
	ours.put_book(&frog, "Frog", &BookStatus::new("c-1"), false)
		.unwrap();
	ours.set_status("Frog", &BookStatus::new("c-1").with_lock("alice", "laptop"))
		.unwrap();

	if let Ok(change) = timeout(QUIET, changes_rx.recv()).await {
		panic!("our own writes were reported: {change:?}");
	}

	// Someone else, through their sync client
	let theirs = repository(repo_dir.path());
	let toad = make_book(local.path(), "Toad", "croak");
	theirs
		.put_book(&toad, "Toad", &BookStatus::new("c-1"), false)
		.unwrap();

	let kind = change_for(&changes_rx, "Toad").await;
	assert!(
		matches!(kind, Some(ChangeKind::Created | ChangeKind::Changed)),
		"{kind:?}"
	);

	// past the grace window a foreign write to a book we wrote is news again
	sleep(Duration::from_millis(500)).await;
	theirs
		.put_book(&toad, "Frog", &BookStatus::new("c-1"), false)
		.unwrap();
	let kind = change_for(&changes_rx, "Frog").await;
	assert!(
		matches!(kind, Some(ChangeKind::Created | ChangeKind::Changed)),
		"{kind:?}"
	);

	theirs.delete_book("Toad", true).unwrap();
	let mut kind = change_for(&changes_rx, "Toad").await;
	while matches!(kind, Some(ChangeKind::Created | ChangeKind::Changed)) {
		kind = change_for(&changes_rx, "Toad").await;
	}
	assert_eq!(kind, Some(ChangeKind::Deleted));

	ours.set_write_tracker(None);
	watcher.stop().await;
	assert!(changes_rx.recv().await.is_err());
}

#[tokio::test]
async fn collection_files_changes_are_reported_by_group() {
	let local = tempdir().unwrap();
	let repo_dir = tempdir().unwrap();
	let repo = repository(repo_dir.path());

	let (watcher, changes_rx) = RepoWatcher::start(repo.layout().clone(), CONFIG).unwrap();

	let words = local.path().join("Allowed Words");
	std::fs::create_dir_all(&words).unwrap();
	std::fs::write(words.join("words.txt"), "frog").unwrap();
	repo.put_collection_files("Allowed Words", tc_core::CollectionFiles::Folder(&words))
		.unwrap();

	let change = timeout(GIVE_UP, changes_rx.recv()).await.unwrap().unwrap();
	assert_eq!(
		change,
		RepoChange::CollectionFiles {
			name: "Allowed Words".to_string()
		}
	);

	watcher.stop().await;
}

#[tokio::test]
async fn missing_repository_cannot_be_watched() {
	let repo_dir = tempdir().unwrap();
	let repo = repository(&repo_dir.path().join("not here"));

	assert!(matches!(
		RepoWatcher::start(repo.layout().clone(), CONFIG),
		Err(tc_core::WatcherError::RootMissing(_))
	));
}
