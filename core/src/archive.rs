//! Book archive codec.
//!
//! An archive is a single file holding a whole book folder:
//!
//! ```text
//! magic      b"tcbook1"   (the trailing digit is the format version)
//! status_len u32 LE
//! status     status_len bytes of `BookStatus` JSON
//! body       tar.gz of the folder, entries relative to the folder
//! ```
//!
//! The status sits in front of the compressed body so it can be read without touching the
//! content, and rewritten by copying the compressed bytes verbatim.

use std::{
	fs::{self, File},
	io::{self, BufReader, Read, Write},
	path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Archive, Builder, HeaderMode};
use thiserror::Error;
use tracing::trace;

use crate::{atomic_write::replace_atomically, error::FileIOError, BookStatus};

const MAGIC: &[u8; 7] = b"tcbook1";
/// Statuses are a handful of short strings; anything bigger is garbage.
const MAX_STATUS_LEN: u32 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
	#[error("archive not found: '{}'", .0.display())]
	NotFound(Box<Path>),
	#[error("malformed archive header: {0}")]
	MalformedHeader(&'static str),
	#[error("malformed archive status: {0}")]
	MalformedStatus(#[from] serde_json::Error),
	#[error("malformed archive content: {0}")]
	MalformedBody(#[source] io::Error),

	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl ArchiveError {
	/// The container itself could not be decoded, as opposed to the disk failing us.
	#[must_use]
	pub const fn is_corrupt(&self) -> bool {
		matches!(
			self,
			Self::MalformedHeader(_) | Self::MalformedStatus(_) | Self::MalformedBody(_)
		)
	}
}

fn write_header(writer: &mut impl Write, status: &BookStatus) -> io::Result<()> {
	let status = serde_json::to_vec(status)?;
	let len = u32::try_from(status.len())
		.ok()
		.filter(|len| *len <= MAX_STATUS_LEN)
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "status too large"))?;

	writer.write_all(MAGIC)?;
	writer.write_all(&len.to_le_bytes())?;
	writer.write_all(&status)
}

fn read_header(reader: &mut impl Read) -> Result<BookStatus, ArchiveError> {
	let mut buf = [0u8; MAGIC.len() + 4];
	reader.read_exact(&mut buf).map_err(|e| match e.kind() {
		io::ErrorKind::UnexpectedEof => ArchiveError::MalformedHeader("truncated header"),
		_ => ArchiveError::MalformedBody(e),
	})?;

	if &buf[..MAGIC.len()] != MAGIC {
		return Err(ArchiveError::MalformedHeader("unknown magic"));
	}

	let len = u32::from_le_bytes(
		buf[MAGIC.len()..]
			.try_into()
			.map_err(|_| ArchiveError::MalformedHeader("bad status length"))?,
	);
	if len > MAX_STATUS_LEN {
		return Err(ArchiveError::MalformedHeader("status too large"));
	}

	let mut status = vec![0; len as usize];
	reader.read_exact(&mut status).map_err(|e| match e.kind() {
		io::ErrorKind::UnexpectedEof => ArchiveError::MalformedHeader("truncated status"),
		_ => ArchiveError::MalformedBody(e),
	})?;

	Ok(serde_json::from_slice(&status)?)
}

/// Files and directories under `root`, sorted, as (absolute, relative, is_dir).
fn collect_entries(root: &Path) -> Result<Vec<(PathBuf, PathBuf, bool)>, FileIOError> {
	fn walk(
		root: &Path,
		dir: &Path,
		out: &mut Vec<(PathBuf, PathBuf, bool)>,
	) -> Result<(), FileIOError> {
		let mut children = fs::read_dir(dir)
			.map_err(|e| FileIOError::from((dir, e, "reading book folder")))?
			.map(|entry| entry.map(|entry| entry.path()))
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| FileIOError::from((dir, e, "reading book folder")))?;
		children.sort();

		for path in children {
			let is_dir = path.is_dir();
			let relative = path
				.strip_prefix(root)
				.map(Path::to_path_buf)
				.unwrap_or_else(|_| path.clone());

			out.push((path.clone(), relative, is_dir));
			if is_dir {
				walk(root, &path, out)?;
			}
		}

		Ok(())
	}

	let mut out = vec![];
	walk(root, root, &mut out)?;
	Ok(out)
}

fn append_entries<W: Write>(
	writer: W,
	source: &Path,
	entries: impl IntoIterator<Item = (PathBuf, PathBuf, bool)>,
) -> Result<W, ArchiveError> {
	let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
	// Fixed mtimes and owners, so repacking unchanged content yields the same bytes
	builder.mode(HeaderMode::Deterministic);

	for (path, relative, is_dir) in entries {
		let appended = if is_dir {
			builder.append_dir(&relative, &path)
		} else {
			builder.append_path_with_name(&path, &relative)
		};
		appended.map_err(|e| FileIOError::from((&path, e, "packing")))?;
	}

	let compressed = builder
		.into_inner()
		.and_then(GzEncoder::finish)
		.map_err(|e| FileIOError::from((source, e, "compressing")))?;

	Ok(compressed)
}

/// Pack the whole `source` folder with `status` in the header.
pub fn pack<W: Write>(source: &Path, status: &BookStatus, mut writer: W) -> Result<W, ArchiveError> {
	let entries = collect_entries(source)?;
	trace!(source = %source.display(), entries = entries.len(), "Packing folder;");

	write_header(&mut writer, status).map_err(|e| FileIOError::from((source, e, "writing header")))?;

	append_entries(writer, source, entries)
}

/// Pack only the named files directly inside `root`; missing names are skipped.
pub fn pack_files<W: Write>(
	root: &Path,
	names: &[String],
	status: &BookStatus,
	mut writer: W,
) -> Result<W, ArchiveError> {
	let mut names = names.iter().collect::<Vec<_>>();
	names.sort();
	names.dedup();

	let entries = names
		.into_iter()
		.map(|name| (root.join(name), PathBuf::from(name), false))
		.filter(|(path, _, _)| path.is_file())
		.collect::<Vec<_>>();

	write_header(&mut writer, status).map_err(|e| FileIOError::from((root, e, "writing header")))?;

	append_entries(writer, root, entries)
}

/// Unpack an archive stream into `dest`, returning the embedded status.
pub fn unpack(reader: impl Read, dest: &Path) -> Result<BookStatus, ArchiveError> {
	let mut reader = BufReader::new(reader);
	let status = read_header(&mut reader)?;

	fs::create_dir_all(dest).map_err(|e| FileIOError::from((dest, e, "creating destination")))?;

	let body_error = |e: io::Error| match e.kind() {
		io::ErrorKind::InvalidData
		| io::ErrorKind::InvalidInput
		| io::ErrorKind::UnexpectedEof
		| io::ErrorKind::Other => ArchiveError::MalformedBody(e),
		_ => FileIOError::from((dest, e, "unpacking")).into(),
	};

	let mut archive = Archive::new(GzDecoder::new(reader));
	archive.set_preserve_mtime(false);
	archive.unpack(dest).map_err(body_error)?;

	// Tar stops at its end marker; drain the rest so the gzip trailer gets checked too
	io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(body_error)?;

	Ok(status)
}

fn open(path: &Path) -> Result<File, ArchiveError> {
	File::open(path).map_err(|e| match e.kind() {
		io::ErrorKind::NotFound => ArchiveError::NotFound(path.into()),
		_ => FileIOError::from((path, e, "opening archive")).into(),
	})
}

pub fn unpack_file(archive: &Path, dest: &Path) -> Result<BookStatus, ArchiveError> {
	unpack(open(archive)?, dest)
}

/// Read only the status header of the archive at `path`.
pub fn read_status(path: &Path) -> Result<BookStatus, ArchiveError> {
	read_header(&mut BufReader::new(open(path)?))
}

/// Swap the status of the archive at `path`, copying the compressed content as is.
pub fn write_status(path: &Path, status: &BookStatus) -> Result<(), ArchiveError> {
	let mut reader = BufReader::new(open(path)?);
	// validates the existing container before we replace anything
	read_header(&mut reader)?;

	replace_atomically::<ArchiveError>(path, move |writer| {
		write_header(writer, status).map_err(|e| FileIOError::from((path, e, "writing header")))?;
		io::copy(&mut reader, writer).map_err(|e| FileIOError::from((path, e, "copying content")))?;
		// the original has to be closed before the rename on some platforms
		drop(reader);
		Ok(())
	})
}

/// Content fingerprint of a folder, used as the book version token.
pub fn book_checksum(folder: &Path) -> Result<String, FileIOError> {
	let mut hasher = blake3::Hasher::new();

	for (path, relative, is_dir) in collect_entries(folder)? {
		if is_dir {
			continue;
		}

		// Separator independent so every platform agrees on the token
		let relative = relative
			.components()
			.map(|component| component.as_os_str().to_string_lossy())
			.collect::<Vec<_>>()
			.join("/");
		hasher.update(relative.as_bytes());
		hasher.update(&[0]);

		let mut file = File::open(&path).map_err(|e| FileIOError::from((&path, e, "hashing")))?;
		let len = file
			.metadata()
			.map_err(|e| FileIOError::from((&path, e, "hashing")))?
			.len();
		hasher.update(&len.to_le_bytes());
		io::copy(&mut file, &mut hasher).map_err(|e| FileIOError::from((&path, e, "hashing")))?;
	}

	Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use std::collections::BTreeMap;

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	use super::*;

	fn make_book(root: &Path) {
		fs::create_dir_all(root.join("images")).unwrap();
		fs::write(root.join("Frog.htm"), "<html>ribbit</html>").unwrap();
		fs::write(root.join("images").join("frog.png"), [0u8, 1, 2, 3, 255]).unwrap();
		fs::write(root.join("meta.json"), r#"{"title":"Frog"}"#).unwrap();
	}

	fn header_len(status: &BookStatus) -> usize {
		MAGIC.len() + 4 + serde_json::to_vec(status).unwrap().len()
	}

	fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
		collect_entries(root)
			.unwrap()
			.into_iter()
			.filter(|(_, _, is_dir)| !is_dir)
			.map(|(path, relative, _)| (relative, fs::read(path).unwrap()))
			.collect()
	}

	#[test]
	fn pack_then_unpack_restores_folder_and_status() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("Frog");
		make_book(&source);

		let status = BookStatus::new("c-1").with_lock("alice", "laptop");
		let bytes = pack(&source, &status, Vec::new()).unwrap();

		let dest = dir.path().join("out");
		let unpacked = unpack(bytes.as_slice(), &dest).unwrap();

		assert_eq!(unpacked, status);
		assert_eq!(read_tree(&dest), read_tree(&source));
	}

	#[test]
	fn repacking_unchanged_content_is_stable() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("Frog");
		make_book(&source);

		let status = BookStatus::new("c-1");
		let first = pack(&source, &status, Vec::new()).unwrap();
		let second = pack(&source, &status, Vec::new()).unwrap();

		assert_eq!(first.len(), second.len());
		assert_eq!(first, second);
	}

	#[test]
	fn status_is_rewritten_without_touching_content() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("Frog");
		make_book(&source);

		let archive = dir.path().join("Frog.archive");
		let original = BookStatus::new("c-1").with_version("v1");
		fs::write(&archive, pack(&source, &original, Vec::new()).unwrap()).unwrap();
		let body_before = fs::read(&archive).unwrap()[header_len(&original)..].to_vec();

		let locked = original.clone().with_lock("bob", "desktop");
		write_status(&archive, &locked).unwrap();

		assert_eq!(read_status(&archive).unwrap(), locked);
		let body_after = fs::read(&archive).unwrap()[header_len(&locked)..].to_vec();
		assert_eq!(body_before, body_after);

		let dest = dir.path().join("out");
		unpack_file(&archive, &dest).unwrap();
		assert_eq!(read_tree(&dest), read_tree(&source));
	}

	#[test]
	fn garbage_is_reported_as_corrupt() {
		let dir = tempdir().unwrap();
		let archive = dir.path().join("Frog.archive");

		fs::write(&archive, b"PK\x03\x04 definitely not ours").unwrap();
		assert!(read_status(&archive).unwrap_err().is_corrupt());
		assert!(write_status(&archive, &BookStatus::default())
			.unwrap_err()
			.is_corrupt());

		fs::write(&archive, b"tcb").unwrap();
		assert!(read_status(&archive).unwrap_err().is_corrupt());
	}

	#[test]
	fn mangled_body_is_corrupt() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("Frog");
		make_book(&source);

		let status = BookStatus::new("c-1");
		let mut bytes = pack(&source, &status, Vec::new()).unwrap();
		bytes.truncate(header_len(&status));
		bytes.extend_from_slice(b"this was never gzip");

		let err = unpack(bytes.as_slice(), &dir.path().join("out")).unwrap_err();
		assert!(err.is_corrupt(), "{err:?}");
	}

	#[test]
	fn missing_archive_is_not_found() {
		let dir = tempdir().unwrap();
		assert!(matches!(
			read_status(&dir.path().join("Nope.archive")),
			Err(ArchiveError::NotFound(_))
		));
	}

	#[test]
	fn pack_files_only_takes_named_root_files() {
		let dir = tempdir().unwrap();
		let root = dir.path().join("collection");
		make_book(&root);

		let bytes = pack_files(
			&root,
			&["meta.json".to_string(), "missing.json".to_string()],
			&BookStatus::default(),
			Vec::new(),
		)
		.unwrap();

		let dest = dir.path().join("out");
		unpack(bytes.as_slice(), &dest).unwrap();

		let tree = read_tree(&dest);
		assert_eq!(tree.len(), 1);
		assert!(tree.contains_key(Path::new("meta.json")));
	}

	#[test]
	fn checksum_follows_content() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("Frog");
		make_book(&source);

		let first = book_checksum(&source).unwrap();
		assert_eq!(first, book_checksum(&source).unwrap());

		fs::write(source.join("Frog.htm"), "<html>croak</html>").unwrap();
		assert_ne!(first, book_checksum(&source).unwrap());
	}
}
