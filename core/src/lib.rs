//! Team Collection synchronization engine.
//!
//! A Team Collection is a collection of book folders shared between several people through
//! a folder that some file sync client (or a LAN share) keeps in step between machines. There
//! is no server: every book travels as one archive file, edits are guarded by an advisory
//! checkout lock stored in the archive itself, deletions leave tombstones, and a watcher turns
//! other people's changes into [`Notification`]s while ignoring our own writes.
//!
//! [`TeamCollection`] holds the algorithm and works against any [`RepositoryBackend`];
//! [`FolderRepository`] is the shared-folder backend and [`Session`] wires everything
//! together for a running application.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod archive;
mod atomic_write;
pub mod config;
pub mod connection;
pub mod error;
pub mod message_log;
pub mod notification;
mod orchestrator;
pub mod own_write;
pub mod repository;
mod session;
mod status;
pub mod sync_state;
pub mod watcher;

pub use config::{ConfigError, TeamCollectionConfig};
pub use connection::{ConnectionProblem, SyncAgent};
pub use message_log::{CollectionStatus, MessageKind, MessageLog, TeamCollectionMessage};
pub use notification::Notification;
pub use orchestrator::{BookState, Conflict, SyncReport, TeamCollection, TeamCollectionError};
pub use repository::{
	ChangeKind, CollectionFiles, FetchError, FolderRepository, JoinFile, RepoChange, RepoError,
	RepositoryBackend,
};
pub use session::{
	open_folder_collection, FolderTeamCollection, JoinContext, Session, SessionError,
};
pub use status::BookStatus;
pub use watcher::{RepoWatcher, WatcherConfig, WatcherError};
