//! Durable log of what happened to the collection, for the user to review.

use std::{
	fs::{self, OpenOptions},
	io::{self, Write},
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{atomic_write::replace_atomically, error::FileIOError};

pub const MESSAGE_LOG_FILE_NAME: &str = "team-collection-log.jsonl";

/// Messages kept when the log is compacted, the newest ones win.
pub const MAX_MESSAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
	History,
	NewStuff,
	Warning,
	Error,
	/// Local work was set aside in Lost and Found
	ClobberPending,
	Disconnected,
	Reconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCollectionMessage {
	pub when: DateTime<Utc>,
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub book: Option<String>,
	pub text: String,
}

/// Overall condition of the collection, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionStatus {
	Disconnected,
	ClobberPending,
	Error,
	NewStuff,
	Nominal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum LogLine {
	Message(TeamCollectionMessage),
	Seen { when: DateTime<Utc> },
}

#[derive(Debug)]
pub struct MessageLog {
	path: PathBuf,
	messages: Vec<TeamCollectionMessage>,
	last_seen: Option<DateTime<Utc>>,
	max_messages: usize,
}

impl MessageLog {
	#[must_use]
	pub fn path(local_collection: &Path) -> PathBuf {
		local_collection.join(MESSAGE_LOG_FILE_NAME)
	}

	pub fn load(local_collection: &Path) -> Result<Self, FileIOError> {
		Self::load_with_limit(local_collection, MAX_MESSAGES)
	}

	/// Unreadable lines, like a write cut short, are skipped. A log holding more than
	/// `max_messages` is compacted right away.
	pub fn load_with_limit(local_collection: &Path, max_messages: usize) -> Result<Self, FileIOError> {
		let path = Self::path(local_collection);
		let mut log = Self {
			path,
			messages: vec![],
			last_seen: None,
			max_messages: max_messages.max(1),
		};

		let content = match fs::read_to_string(&log.path) {
			Ok(content) => content,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(log),
			Err(e) => return Err(FileIOError::from((&log.path, e, "reading message log"))),
		};

		for (number, line) in content.lines().enumerate() {
			if line.trim().is_empty() {
				continue;
			}

			match serde_json::from_str(line) {
				Ok(LogLine::Message(message)) => log.messages.push(message),
				Ok(LogLine::Seen { when }) => log.last_seen = Some(when),
				Err(e) => warn!(line = number + 1, ?e, "Skipping unreadable message log line;"),
			}
		}

		if log.messages.len() > log.max_messages {
			log.compact()?;
		}

		Ok(log)
	}

	fn encode(&self, line: &LogLine) -> Result<String, FileIOError> {
		let mut json = serde_json::to_string(line)
			.map_err(|e| FileIOError::from((&self.path, io::Error::from(e), "encoding message")))?;
		json.push('\n');
		Ok(json)
	}

	fn append(&self, line: &LogLine) -> Result<(), FileIOError> {
		let json = self.encode(line)?;

		OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.and_then(|mut file| file.write_all(json.as_bytes()))
			.map_err(|e| FileIOError::from((&self.path, e, "writing message log")))
	}

	/// Drop the oldest messages and rewrite the file with what is left.
	fn compact(&mut self) -> Result<(), FileIOError> {
		let dropped = self.messages.len().saturating_sub(self.max_messages);
		self.messages.drain(..dropped);

		let mut lines = self
			.messages
			.iter()
			.map(|message| self.encode(&LogLine::Message(message.clone())))
			.collect::<Result<Vec<_>, _>>()?;
		if let Some(when) = self.last_seen {
			lines.push(self.encode(&LogLine::Seen { when })?);
		}

		replace_atomically::<FileIOError>(&self.path, |writer| {
			writer
				.write_all(lines.concat().as_bytes())
				.map_err(|e| FileIOError::from((&self.path, e, "compacting message log")))
		})?;

		debug!(dropped, kept = self.messages.len(), "Compacted message log");
		Ok(())
	}

	pub fn add(
		&mut self,
		kind: MessageKind,
		book: Option<&str>,
		text: impl Into<String>,
	) -> Result<(), FileIOError> {
		let message = TeamCollectionMessage {
			when: Utc::now(),
			kind,
			book: book.map(ToString::to_string),
			text: text.into(),
		};
		info!(?kind, book, text = %message.text, "Team Collection message;");

		self.append(&LogLine::Message(message.clone()))?;
		self.messages.push(message);

		// Some slack, so a full log is not rewritten on every message
		if self.messages.len() > self.max_messages + self.max_messages / 4 {
			self.compact()?;
		}

		Ok(())
	}

	#[must_use]
	pub fn messages(&self) -> &[TeamCollectionMessage] {
		&self.messages
	}

	pub fn unseen(&self) -> impl Iterator<Item = &TeamCollectionMessage> {
		self.messages
			.iter()
			.filter(|message| self.last_seen.map_or(true, |seen| message.when > seen))
	}

	/// The user has looked at everything logged so far.
	pub fn mark_seen(&mut self) -> Result<(), FileIOError> {
		let when = Utc::now();
		self.append(&LogLine::Seen { when })?;
		self.last_seen = Some(when);
		Ok(())
	}

	#[must_use]
	pub fn collection_status(&self) -> CollectionStatus {
		let disconnected = self
			.messages
			.iter()
			.rev()
			.find(|message| matches!(message.kind, MessageKind::Disconnected | MessageKind::Reconnected))
			.is_some_and(|message| message.kind == MessageKind::Disconnected);
		if disconnected {
			return CollectionStatus::Disconnected;
		}

		self.unseen()
			.filter_map(|message| match message.kind {
				MessageKind::ClobberPending => Some(CollectionStatus::ClobberPending),
				MessageKind::Error => Some(CollectionStatus::Error),
				MessageKind::NewStuff => Some(CollectionStatus::NewStuff),
				_ => None,
			})
			.min()
			.unwrap_or(CollectionStatus::Nominal)
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn status_follows_unseen_messages() {
		let dir = tempdir().unwrap();
		let mut log = MessageLog::load(dir.path()).unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::Nominal);

		log.add(MessageKind::History, Some("Frog"), "checked in").unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::Nominal);

		log.add(MessageKind::NewStuff, Some("Toad"), "new book").unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::NewStuff);

		log.add(MessageKind::Error, Some("Newt"), "corrupt").unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::Error);

		log.mark_seen().unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::Nominal);
	}

	#[test]
	fn disconnection_wins_until_reconnected() {
		let dir = tempdir().unwrap();
		let mut log = MessageLog::load(dir.path()).unwrap();

		log.add(MessageKind::ClobberPending, Some("Frog"), "moved").unwrap();
		log.add(MessageKind::Disconnected, None, "gone").unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::Disconnected);

		log.add(MessageKind::Reconnected, None, "back").unwrap();
		assert_eq!(log.collection_status(), CollectionStatus::ClobberPending);
	}

	#[test]
	fn old_messages_are_dropped_as_the_log_grows() {
		let dir = tempdir().unwrap();
		let texts = |log: &MessageLog| {
			log.messages()
				.iter()
				.map(|message| message.text.clone())
				.collect::<Vec<_>>()
		};

		let mut log = MessageLog::load_with_limit(dir.path(), 4).unwrap();
		for n in 0..5 {
			log.add(MessageKind::History, None, format!("message {n}")).unwrap();
		}
		assert_eq!(log.messages().len(), 5);

		log.mark_seen().unwrap();
		log.add(MessageKind::NewStuff, Some("Frog"), "message 5").unwrap();
		assert_eq!(texts(&log), ["message 2", "message 3", "message 4", "message 5"]);

		// four messages and the seen marker
		let file = fs::read_to_string(MessageLog::path(dir.path())).unwrap();
		assert_eq!(file.lines().count(), 5);

		let reloaded = MessageLog::load_with_limit(dir.path(), 4).unwrap();
		assert_eq!(reloaded.messages(), log.messages());
		assert_eq!(reloaded.unseen().count(), 1);

		let smaller = MessageLog::load_with_limit(dir.path(), 2).unwrap();
		assert_eq!(texts(&smaller), ["message 4", "message 5"]);
		assert_eq!(smaller.collection_status(), CollectionStatus::NewStuff);
		let file = fs::read_to_string(MessageLog::path(dir.path())).unwrap();
		assert_eq!(file.lines().count(), 3);
	}

	#[test]
	fn survives_reload_and_skips_garbage() {
		let dir = tempdir().unwrap();
		let mut log = MessageLog::load(dir.path()).unwrap();
		log.add(MessageKind::Warning, None, "careful").unwrap();
		log.mark_seen().unwrap();
		log.add(MessageKind::NewStuff, Some("Frog"), "new").unwrap();

		let mut raw = OpenOptions::new()
			.append(true)
			.open(MessageLog::path(dir.path()))
			.unwrap();
		raw.write_all(b"{\"type\":\"mess").unwrap();

		let reloaded = MessageLog::load(dir.path()).unwrap();
		assert_eq!(reloaded.messages(), log.messages());
		assert_eq!(reloaded.unseen().count(), 1);
		assert_eq!(reloaded.collection_status(), CollectionStatus::NewStuff);
	}
}
