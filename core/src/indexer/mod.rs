use crate::{
	archive::{ArchiveError, ArchiveHandle},
	events::{EventBus, IndexEvent},
	store::{IndexMeta, StoreError, TableStore},
	table::Tables,
};

use adb_keyed_lock::KeyedLock;

use std::{collections::BTreeSet, sync::Arc};

use futures_concurrency::future::Join;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

mod apply;
mod scan;

pub use apply::{apply_updates, ApplyError};
pub use scan::scan_archive_history_for_updates;

#[derive(Error, Debug)]
pub enum IndexerError {
	#[error(transparent)]
	Archive(#[from] ArchiveError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
	/// The store was closed; nothing was read or written.
	StoreUnavailable,
	/// The archive had nothing newer than `version`.
	UpToDate { version: u64 },
	/// Changes in `(from, version]` were applied, touching `tables`.
	Indexed {
		from: u64,
		version: u64,
		tables: BTreeSet<String>,
	},
}

/// Runs index and unindex passes, one at a time per archive.
#[derive(Debug)]
pub struct Indexer {
	store: Arc<dyn TableStore>,
	tables: Arc<Tables>,
	events: EventBus,
	locks: KeyedLock<String>,
}

impl Indexer {
	#[must_use]
	pub fn new(store: Arc<dyn TableStore>, tables: Tables, events: EventBus) -> Self {
		Self {
			store,
			tables: Arc::new(tables),
			events,
			locks: KeyedLock::new(),
		}
	}

	#[must_use]
	pub fn store(&self) -> &Arc<dyn TableStore> {
		&self.store
	}

	#[must_use]
	pub fn tables(&self) -> &Tables {
		&self.tables
	}

	#[must_use]
	pub const fn events(&self) -> &EventBus {
		&self.events
	}

	/// Brings the store up to date with the archive's current version.
	///
	/// With `needs_rebuild` the persisted version is ignored and the whole history is replayed.
	/// The persisted version only moves once every update in the window was applied, failed
	/// records included; it stays put if the store is closed or the archive can't be read.
	#[instrument(skip_all, fields(archive_url = %archive.url(), needs_rebuild = needs_rebuild), err)]
	pub async fn index_archive(
		&self,
		archive: &ArchiveHandle,
		needs_rebuild: bool,
	) -> Result<IndexOutcome, IndexerError> {
		let _guard = self.locks.lock(lock_key(archive.url())).await;

		if !self.store.is_open() {
			warn!("Table store is unavailable, skipping index pass");
			return Ok(IndexOutcome::StoreUnavailable);
		}

		let (index_meta, info) = (
			self.store.get_index_meta(archive.url()),
			archive.get_info(),
		)
			.join()
			.await;

		let info = info?;
		let indexed_version = if needs_rebuild {
			0
		} else {
			index_meta?.map_or(0, |meta| meta.version)
		};

		if indexed_version >= info.version {
			trace!(version = indexed_version, "Archive already indexed");
			return Ok(IndexOutcome::UpToDate {
				version: indexed_version,
			});
		}

		let updates = scan_archive_history_for_updates(
			archive.archive().as_ref(),
			&self.tables,
			indexed_version + 1..info.version + 1,
		)
		.await?;

		let tables = apply_updates(self.store.as_ref(), &self.tables, archive, &updates)
			.await
			.into_iter()
			.flatten()
			.collect::<BTreeSet<_>>();

		self.store
			.put_index_meta(IndexMeta::new(
				archive.url(),
				info.version,
				archive.is_writable(),
			))
			.await?;

		for table in &tables {
			self.events.emit(IndexEvent::IndexUpdated {
				table: table.clone(),
				archive_url: archive.url().to_string(),
				version: info.version,
			});
		}

		self.events.emit(IndexEvent::IndexesUpdated {
			archive_url: archive.url().to_string(),
			version: info.version,
		});

		debug!(
			from = indexed_version,
			to = info.version,
			updates = updates.len(),
			?tables,
			"Indexed archive",
		);

		Ok(IndexOutcome::Indexed {
			from: indexed_version,
			version: info.version,
			tables,
		})
	}

	/// Removes every record the archive contributed and forgets its indexed version.
	///
	/// Shares the archive's lock with [`Self::index_archive`], so it never overlaps an index pass.
	#[instrument(skip_all, fields(archive_url = %archive.url()), err)]
	pub async fn unindex_archive(&self, archive: &ArchiveHandle) -> Result<(), IndexerError> {
		let _guard = self.locks.lock(lock_key(archive.url())).await;

		if !self.store.is_open() {
			return Err(StoreError::Closed.into());
		}

		match self
			.tables
			.list_record_files(archive.archive().as_ref())
			.await
		{
			Ok(files) => {
				for file in &files {
					self.store.delete(&file.table, &file.record_url).await?;
				}

				trace!(files = files.len(), "Unindexed archive record files");
			}
			Err(e) => {
				warn!(?e, "Unable to list archive files, falling back to stored records;");
			}
		}

		// Records whose files are gone from the archive, or that we couldn't list, are still
		// attributed to it through their origin
		for table in self.tables.iter() {
			for record in self.store.records(table.name()).await? {
				if record.origin == archive.url() {
					self.store.delete(table.name(), &record.url).await?;
				}
			}
		}

		self.store.delete_index_meta(archive.url()).await?;

		self.events.emit(IndexEvent::ArchiveUnindexed {
			archive_url: archive.url().to_string(),
		});

		debug!("Unindexed archive");

		Ok(())
	}
}

fn lock_key(archive_url: &str) -> String {
	format!("index:{archive_url}")
}
