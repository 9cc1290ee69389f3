//! Per-book status record.
//!
//! A [`BookStatus`] has no storage of its own: it lives in the header of the book's
//! current archive, so changing it means rewriting that header.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookStatus {
	/// User holding the advisory edit lock, `None` when the book is free.
	pub locked_by: Option<String>,
	/// Device the lock was taken on; the same user may work from several machines.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub locked_where: Option<String>,
	pub locked_when: Option<DateTime<Utc>>,
	/// Changes whenever the book content changes.
	#[serde(default)]
	pub version_token: String,
	#[serde(default)]
	pub collection_id: String,
}

impl BookStatus {
	#[must_use]
	pub fn new(collection_id: impl Into<String>) -> Self {
		Self {
			collection_id: collection_id.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_lock(self, user: impl Into<String>, device: impl Into<String>) -> Self {
		Self {
			locked_by: Some(user.into()),
			locked_where: Some(device.into()),
			locked_when: Some(Utc::now()),
			..self
		}
	}

	#[must_use]
	pub fn without_lock(self) -> Self {
		Self {
			locked_by: None,
			locked_where: None,
			locked_when: None,
			..self
		}
	}

	#[must_use]
	pub fn with_version(self, version_token: impl Into<String>) -> Self {
		Self {
			version_token: version_token.into(),
			..self
		}
	}

	#[must_use]
	pub const fn is_locked(&self) -> bool {
		self.locked_by.is_some()
	}

	/// Locked by this user on this device. A lock without a recorded device is
	/// treated as belonging to the user wherever they are.
	#[must_use]
	pub fn is_locked_by(&self, user: &str, device: &str) -> bool {
		self.locked_by.as_deref() == Some(user)
			&& self
				.locked_where
				.as_deref()
				.map_or(true, |locked_where| locked_where == device)
	}

	#[must_use]
	pub fn is_locked_by_other(&self, user: &str, device: &str) -> bool {
		self.is_locked() && !self.is_locked_by(user, device)
	}

	#[must_use]
	pub fn belongs_to(&self, collection_id: &str) -> bool {
		self.collection_id.is_empty() || self.collection_id == collection_id
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn json_uses_camel_case_field_names() {
		let status = BookStatus::new("c-1").with_version("v1");
		let json = serde_json::to_value(&status).unwrap();

		assert_eq!(
			json,
			serde_json::json!({
				"lockedBy": null,
				"lockedWhen": null,
				"versionToken": "v1",
				"collectionId": "c-1",
			})
		);
	}

	#[test]
	fn lock_round_trips_through_json() {
		let status = BookStatus::new("c-1").with_lock("alice", "laptop");
		let json = serde_json::to_string(&status).unwrap();
		let decoded: BookStatus = serde_json::from_str(&json).unwrap();

		assert_eq!(decoded, status);
		assert!(json.contains("\"lockedWhere\":\"laptop\""));
	}

	#[test]
	fn minimal_json_is_accepted() {
		let decoded: BookStatus =
			serde_json::from_str(r#"{"lockedBy":"alice","lockedWhen":null}"#).unwrap();

		assert_eq!(decoded.locked_by.as_deref(), Some("alice"));
		assert!(decoded.version_token.is_empty());
	}

	#[test]
	fn lock_ownership() {
		let status = BookStatus::new("c-1").with_lock("alice", "laptop");

		assert!(status.is_locked_by("alice", "laptop"));
		assert!(!status.is_locked_by("alice", "desktop"));
		assert!(status.is_locked_by_other("bob", "laptop"));
		assert!(!status.clone().without_lock().is_locked());

		let no_device = BookStatus {
			locked_where: None,
			..status
		};
		assert!(no_device.is_locked_by("alice", "anywhere"));
	}

	#[test]
	fn collection_membership() {
		assert!(BookStatus::new("c-1").belongs_to("c-1"));
		assert!(!BookStatus::new("c-1").belongs_to("c-2"));
		assert!(BookStatus::default().belongs_to("c-2"));
	}
}
