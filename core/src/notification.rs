//! What the rest of the application hears from the collection.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionProblem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
	NewBook { name: String },
	BookStateChanged { name: String },
	BookDeleted { name: String },
	CollectionFilesChanged,
	ConnectionProblem { problem: ConnectionProblem },
}

pub(crate) fn send(tx: &broadcast::Sender<Notification>, notification: Notification) {
	// No receivers is fine, nobody is showing a UI right now
	if let Err(broadcast::error::SendError(notification)) = tx.send(notification) {
		trace!(?notification, "Notification dropped, no subscribers;");
	}
}
