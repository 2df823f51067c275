//! The archive collaborator: an externally-owned, URL-identified set of files with an
//! append-only change history. Replication and storage live behind the [`Archive`] trait.

use adb_schema::normalize_path;

use std::{
	fmt,
	ops::{Deref, Range},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_channel as chan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
	#[error("file not found in archive: <path='{0}'>")]
	FileNotFound(String),
	#[error("archive not found: <url='{0}'>")]
	ArchiveNotFound(String),
	#[error("archive unavailable: {0}")]
	Unavailable(String),
	#[error("unable to open archive activity stream: {0}")]
	Watch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
	pub version: u64,
	pub is_owner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
	Put,
	Del,
}

/// One entry of an archive's change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub path: String,
	#[serde(rename = "type")]
	pub kind: ChangeKind,
	pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileActivity {
	/// A remote update made the local copy of the file stale.
	Invalidated { path: String },
	/// The file's content changed.
	Changed { path: String },
}

impl FileActivity {
	#[must_use]
	pub fn path(&self) -> &str {
		match self {
			Self::Invalidated { path } | Self::Changed { path } => path,
		}
	}
}

#[async_trait]
pub trait Archive: Send + Sync + fmt::Debug + 'static {
	/// Stable identity of the archive.
	fn url(&self) -> &str;

	async fn get_info(&self) -> Result<ArchiveInfo, ArchiveError>;

	async fn read_file(&self, path: &str) -> Result<Vec<u8>, ArchiveError>;

	/// History entries with versions in `range` (`start` inclusive, `end` exclusive), oldest first.
	async fn history(&self, range: Range<u64>) -> Result<Vec<HistoryEntry>, ArchiveError>;

	/// Every file path currently present in the archive.
	async fn list_files(&self) -> Result<Vec<String>, ArchiveError>;

	/// Opens an activity stream for files matching any of `patterns`.
	///
	/// The subscription lasts until the receiver is dropped.
	fn watch(&self, patterns: &[String]) -> Result<chan::Receiver<FileActivity>, ArchiveError>;

	async fn download(&self, path: &str) -> Result<(), ArchiveError>;
}

/// Instantiates archive handles from persisted URLs when the registry loads.
pub trait ArchiveOpener: Send + Sync + fmt::Debug + 'static {
	fn open(&self, url: &str) -> Result<Arc<dyn Archive>, ArchiveError>;
}

/// The registry's live handle on an archive.
#[derive(Debug)]
pub struct ArchiveHandle {
	archive: Arc<dyn Archive>,
	is_writable: AtomicBool,
}

impl ArchiveHandle {
	#[must_use]
	pub fn new(archive: Arc<dyn Archive>) -> Self {
		Self {
			archive,
			is_writable: AtomicBool::new(false),
		}
	}

	#[must_use]
	pub fn with_writable(self, is_writable: bool) -> Self {
		self.set_writable(is_writable);
		self
	}

	#[must_use]
	pub fn is_writable(&self) -> bool {
		self.is_writable.load(Ordering::Acquire)
	}

	pub fn set_writable(&self, is_writable: bool) {
		self.is_writable.store(is_writable, Ordering::Release);
	}

	#[must_use]
	pub fn record_url(&self, path: &str) -> String {
		record_url(self.archive.url(), path)
	}

	#[must_use]
	pub fn archive(&self) -> &Arc<dyn Archive> {
		&self.archive
	}
}

impl Deref for ArchiveHandle {
	type Target = dyn Archive;

	fn deref(&self) -> &Self::Target {
		self.archive.as_ref()
	}
}

/// Unique key of the record ingested from `path`.
#[must_use]
pub fn record_url(archive_url: &str, path: &str) -> String {
	format!("{}{}", archive_url.trim_end_matches('/'), normalize_path(path))
}
