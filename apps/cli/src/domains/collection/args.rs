use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct CollectionShareArgs {
	/// Shared folder that will hold the Team Collection
	pub repo: PathBuf,
}

#[derive(Args, Debug)]
pub struct CollectionJoinArgs {
	/// Shared folder holding the Team Collection to join
	pub repo: PathBuf,
}

#[derive(Args, Debug)]
pub struct CollectionStatusArgs {
	/// Mark all messages as seen afterwards
	#[arg(long, default_value_t = false)]
	pub mark_seen: bool,
}
