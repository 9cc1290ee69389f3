use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tc_core::{open_folder_collection, FolderTeamCollection, TeamCollectionConfig};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
	Human,
	Json,
}

#[derive(Debug, Clone)]
pub struct Context {
	pub collection_dir: PathBuf,
	pub format: OutputFormat,
}

impl Context {
	pub const fn new(collection_dir: PathBuf, format: OutputFormat) -> Self {
		Self {
			collection_dir,
			format,
		}
	}

	/// Settings of an already shared or joined collection.
	pub fn config(&self) -> Result<TeamCollectionConfig> {
		TeamCollectionConfig::load_from(&self.collection_dir).with_context(|| {
			format!(
				"'{}' is not part of a Team Collection, share or join one first",
				self.collection_dir.display()
			)
		})
	}

	pub fn open(&self) -> Result<FolderTeamCollection> {
		let config = self.config()?;
		Ok(open_folder_collection(&self.collection_dir, config)?)
	}

	/// Print `output` for people, or as JSON.
	pub fn print<T: Serialize>(&self, output: &T, human: impl FnOnce(&T)) -> Result<()> {
		match self.format {
			OutputFormat::Human => human(output),
			OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
		}

		Ok(())
	}
}
