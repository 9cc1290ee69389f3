//! Same-directory temp files for atomic replacement.
//!
//! Temp files always live next to their destination so the final rename never crosses a
//! volume, and a sync client watching the folder never sees a half-written destination.
//! They are named `<destination file name>.<random>.tmp`, which the own-write filter relies on.

use std::{
	fs::File,
	io::{BufWriter, Write},
	path::Path,
};

use tempfile::NamedTempFile;

use crate::error::FileIOError;

pub const TEMP_SUFFIX: &str = ".tmp";

pub fn temp_sibling(dest: &Path) -> Result<NamedTempFile, FileIOError> {
	let dir = dest
		.parent()
		.filter(|parent| !parent.as_os_str().is_empty())
		.unwrap_or_else(|| Path::new("."));

	let prefix = dest
		.file_name()
		.map(|name| format!("{}.", name.to_string_lossy()))
		.unwrap_or_default();

	tempfile::Builder::new()
		.prefix(&prefix)
		.suffix(TEMP_SUFFIX)
		.tempfile_in(dir)
		.map_err(|e| FileIOError::from((dir, e, "creating temp file")))
}

/// Write a temp sibling of `dest` with `write`; the caller decides how to persist it.
/// If anything fails the temp file is removed when it is dropped.
pub fn write_temp_sibling<E>(
	dest: &Path,
	write: impl FnOnce(&mut BufWriter<&File>) -> Result<(), E>,
) -> Result<NamedTempFile, E>
where
	E: From<FileIOError>,
{
	let temp = temp_sibling(dest)?;

	{
		let mut writer = BufWriter::new(temp.as_file());
		write(&mut writer)?;
		writer
			.flush()
			.map_err(|e| FileIOError::from((temp.path(), e, "flushing temp file")))?;
	}

	temp.as_file()
		.sync_all()
		.map_err(|e| FileIOError::from((temp.path(), e, "syncing temp file")))?;

	Ok(temp)
}

/// Write `dest` through a temp sibling and rename it into place, replacing any existing file.
pub fn replace_atomically<E>(
	dest: &Path,
	write: impl FnOnce(&mut BufWriter<&File>) -> Result<(), E>,
) -> Result<(), E>
where
	E: From<FileIOError>,
{
	write_temp_sibling(dest, write)?
		.persist(dest)
		.map_err(|e| FileIOError::from((dest, e.error, "replacing file")))?;

	Ok(())
}
