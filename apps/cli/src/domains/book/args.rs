use clap::Args;

#[derive(Args, Debug)]
pub struct BookArgs {
	/// Name of the book folder
	pub name: String,
}

#[derive(Args, Debug)]
pub struct BookCheckInArgs {
	/// Name of the book folder
	pub name: String,
	/// Keep the book checked out after sending the changes
	#[arg(long, default_value_t = false)]
	pub keep_locked: bool,
}

#[derive(Args, Debug)]
pub struct BookUnlockArgs {
	/// Name of the book folder
	pub name: String,
	/// Remove the lock even if someone else holds it
	#[arg(long, default_value_t = false)]
	pub force: bool,
}
