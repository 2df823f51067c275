//! Index notifications, published on a broadcast bus scoped to one database instance.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEvent {
	/// Records of `table` changed while indexing `archive_url` up to `version`.
	IndexUpdated {
		table: String,
		archive_url: String,
		version: u64,
	},
	/// An index pass for `archive_url` finished at `version`.
	IndexesUpdated { archive_url: String, version: u64 },
	/// Every record of `archive_url` was removed.
	ArchiveUnindexed { archive_url: String },
}

impl IndexEvent {
	#[must_use]
	pub fn archive_url(&self) -> &str {
		match self {
			Self::IndexUpdated { archive_url, .. }
			| Self::IndexesUpdated { archive_url, .. }
			| Self::ArchiveUnindexed { archive_url } => archive_url,
		}
	}

	#[must_use]
	pub fn event_type(&self) -> &'static str {
		match self {
			Self::IndexUpdated { .. } => "index-updated",
			Self::IndexesUpdated { .. } => "indexes-updated",
			Self::ArchiveUnindexed { .. } => "archive-unindexed",
		}
	}
}

#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<IndexEvent>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_EVENT_CAPACITY)
	}
}

impl EventBus {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	/// Returns how many subscribers received the event; having none is fine.
	pub fn emit(&self, event: IndexEvent) -> usize {
		let event_type = event.event_type();

		self.sender.send(event).map_or_else(
			|_| {
				trace!(event_type, "No subscribers for index event");
				0
			},
			|receivers| {
				trace!(event_type, receivers, "Emitted index event");
				receivers
			},
		)
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
		self.sender.subscribe()
	}

	#[must_use]
	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}
