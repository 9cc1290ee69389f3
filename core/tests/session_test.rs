mod helpers;

use std::{fs, path::Path, time::Duration};

use helpers::{make_book, member};
use pretty_assertions::assert_eq;
use tc_core::{
	BookStatus, CollectionStatus, ConnectionProblem, JoinContext, Notification, RepositoryBackend,
	Session, TeamCollectionConfig,
};
use tempfile::tempdir;
use tokio::{
	sync::broadcast::{self, error::RecvError},
	time::timeout,
};
use tracing_test::traced_test;

const GIVE_UP: Duration = Duration::from_secs(10);

async fn wait_for(
	rx: &mut broadcast::Receiver<Notification>,
	wanted: impl Fn(&Notification) -> bool,
) -> Notification {
	timeout(GIVE_UP, async {
		loop {
			match rx.recv().await {
				Ok(notification) if wanted(&notification) => return notification,
				Ok(other) => tracing::debug!(?other, "Skipping notification;"),
				Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Lagged;"),
				Err(RecvError::Closed) => panic!("notifications closed"),
			}
		}
	})
	.await
	.unwrap()
}

/// Settings for a member who has not joined yet: a collection id of their own, quick timings.
fn save_joining_config(local: &Path, repo: &Path, user: &str) {
	let mut config: TeamCollectionConfig =
		helpers::config(repo, user).with_collection_id("not-joined-yet");
	config.connection_check_interval_ms = 100;
	config.watcher.own_write_grace_ms = 300;
	config.save(local).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn joined_member_hears_about_new_books() {
	let dirs = tempdir().unwrap();
	let repo = dirs.path().join("repo");
	fs::create_dir_all(&repo).unwrap();

	let alice = member(&repo, &dirs.path().join("alice"), "alice");
	make_book(alice.local_path(), "Frog", "ribbit");
	alice.share_local_collection().unwrap();

	let bob_local = dirs.path().join("bob");
	save_joining_config(&bob_local, &repo, "bob");

	let session = Session::start(JoinContext {
		local_collection: bob_local.clone(),
		repo_root: repo.clone(),
		first_time_join: true,
	})
	.await
	.unwrap();
	let mut rx = session.subscribe();

	assert_eq!(
		session.collection().config().collection_id,
		helpers::COLLECTION_ID
	);
	assert_eq!(
		TeamCollectionConfig::load_from(&bob_local).unwrap().collection_id,
		helpers::COLLECTION_ID
	);
	assert_eq!(session.startup_report().unwrap().fetched, ["Frog"]);
	assert!(bob_local.join("Frog").is_dir());

	make_book(alice.local_path(), "Toad", "croak");
	alice.add_book("Toad").unwrap();
	wait_for(&mut rx, |n| {
		*n == Notification::NewBook {
			name: "Toad".to_string(),
		}
	})
	.await;

	alice.checkout("Frog").unwrap();
	wait_for(&mut rx, |n| {
		*n == Notification::BookStateChanged {
			name: "Frog".to_string(),
		}
	})
	.await;

	// bob's own work does not echo back to him
	let bob = session.collection().clone();
	tokio::task::spawn_blocking(move || bob.fetch_book("Toad").and_then(|_| bob.checkout("Toad")))
		.await
		.unwrap()
		.unwrap();
	if let Ok(Ok(notification)) = timeout(Duration::from_millis(800), rx.recv()).await {
		assert!(
			!matches!(&notification, Notification::BookStateChanged { name } if name == "Toad"),
			"{notification:?}"
		);
	}

	session.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn losing_the_repository_pauses_until_it_is_back() {
	let dirs = tempdir().unwrap();
	let repo = dirs.path().join("repo");
	let moved = dirs.path().join("repo-offline");
	fs::create_dir_all(&repo).unwrap();

	let alice = member(&repo, &dirs.path().join("alice"), "alice");
	make_book(alice.local_path(), "Frog", "ribbit");
	alice.share_local_collection().unwrap();

	let bob_local = dirs.path().join("bob");
	save_joining_config(&bob_local, &repo, "bob");

	let session = Session::start(JoinContext {
		local_collection: bob_local.clone(),
		repo_root: repo.clone(),
		first_time_join: true,
	})
	.await
	.unwrap();
	let mut rx = session.subscribe();

	fs::rename(&repo, &moved).unwrap();
	let problem = wait_for(&mut rx, |n| {
		matches!(n, Notification::ConnectionProblem { .. })
	})
	.await;
	assert!(matches!(
		problem,
		Notification::ConnectionProblem {
			problem: ConnectionProblem::RepositoryMissing { .. }
		}
	));
	assert_eq!(
		session.collection().collection_status(),
		CollectionStatus::Disconnected
	);

	// work done by others while we were away
	let newt_source = tempdir().unwrap();
	let newt = make_book(newt_source.path(), "Newt", "splash");
	helpers::repository(&moved)
		.put_book(&newt, "Newt", &BookStatus::new(helpers::COLLECTION_ID), false)
		.unwrap();

	fs::rename(&moved, &repo).unwrap();
	wait_for(&mut rx, |n| {
		*n == Notification::BookStateChanged {
			name: "Newt".to_string(),
		}
	})
	.await;

	assert!(bob_local.join("Newt").is_dir());
	assert_ne!(
		session.collection().collection_status(),
		CollectionStatus::Disconnected
	);

	session.stop().await;
}

#[tokio::test]
async fn joining_needs_a_join_file() {
	let dirs = tempdir().unwrap();
	let repo = dirs.path().join("repo");
	fs::create_dir_all(&repo).unwrap();

	let bob_local = dirs.path().join("bob");
	save_joining_config(&bob_local, &repo, "bob");

	assert!(Session::start(JoinContext {
		local_collection: bob_local,
		repo_root: repo,
		first_time_join: true,
	})
	.await
	.is_err());
}
