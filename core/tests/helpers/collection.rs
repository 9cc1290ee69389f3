use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
};

use tc_core::{
	repository::LockProbeConfig, FolderRepository, TeamCollection, TeamCollectionConfig,
};

pub const COLLECTION_ID: &str = "5a1c0b7e-frog-pond";

pub const QUICK_PROBE: LockProbeConfig = LockProbeConfig {
	attempts: 3,
	initial_delay_ms: 1,
	max_delay_ms: 5,
};

/// A small book folder with a nested file, so packing has something to walk.
pub fn make_book(collection: &Path, name: &str, text: &str) -> PathBuf {
	let book = collection.join(name);
	fs::create_dir_all(book.join("images")).unwrap();
	fs::write(book.join(format!("{name}.htm")), format!("<html>{text}</html>")).unwrap();
	fs::write(book.join("images").join("cover.png"), [137u8, 80, 78, 71, 1, 2, 3]).unwrap();
	book
}

pub fn edit_book(collection: &Path, name: &str, text: &str) {
	fs::write(
		collection.join(name).join(format!("{name}.htm")),
		format!("<html>{text}</html>"),
	)
	.unwrap();
}

pub fn book_text(collection: &Path, name: &str) -> String {
	fs::read_to_string(collection.join(name).join(format!("{name}.htm"))).unwrap()
}

pub fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
	fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
		for entry in fs::read_dir(dir).unwrap() {
			let path = entry.unwrap().path();
			if path.is_dir() {
				walk(root, &path, out);
			} else {
				out.insert(
					path.strip_prefix(root).unwrap().to_path_buf(),
					fs::read(&path).unwrap(),
				);
			}
		}
	}

	let mut out = BTreeMap::new();
	walk(root, root, &mut out);
	out
}

pub fn repository(root: &Path) -> FolderRepository {
	FolderRepository::new(root)
		.with_lock_probe(QUICK_PROBE)
		.with_sync_agent_check(false)
}

pub fn config(repo: &Path, user: &str) -> TeamCollectionConfig {
	let mut config = TeamCollectionConfig::new(repo)
		.with_collection_id(COLLECTION_ID)
		.with_identity(user, format!("{user}-laptop"));
	config.lock_probe = QUICK_PROBE;
	config.check_sync_agent = false;
	config
}

/// One member of the team: their own local collection folder, the shared repository.
pub fn member(repo: &Path, local: &Path, user: &str) -> TeamCollection<FolderRepository> {
	fs::create_dir_all(local).unwrap();
	TeamCollection::open(local, config(repo, user), repository(repo)).unwrap()
}
