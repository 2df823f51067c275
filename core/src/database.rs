use crate::{
	archive::{Archive, ArchiveHandle, ArchiveOpener},
	config::IndexerConfig,
	events::{EventBus, IndexEvent},
	indexer::{IndexOutcome, Indexer},
	rebuild::reset_outdated_indexes,
	registry::{ArchiveRegistry, RegistryError},
	store::{StoreError, TableStore},
	table::Tables,
	Error,
};

use adb_schema::{diff, SchemaHistory};

use std::sync::Arc;

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace};

/// A table store kept in sync with a set of archives under one declared schema.
#[derive(Debug)]
pub struct Database {
	registry: Arc<ArchiveRegistry>,
	schema_version: u32,
	load_passes: Vec<JoinHandle<()>>,
}

impl Database {
	/// Migrates the store to the latest declared schema and starts indexing every known archive.
	///
	/// If the migration flags any table for rebuild, the archives are replayed from version 0.
	#[instrument(skip_all, err)]
	pub async fn open(
		store: Arc<dyn TableStore>,
		opener: Arc<dyn ArchiveOpener>,
		history: &SchemaHistory,
		config: &IndexerConfig,
	) -> Result<Self, Error> {
		if !store.is_open() {
			return Err(StoreError::Closed.into());
		}

		let latest = history.latest()?;
		let stored_version = store.schema_version().await?.unwrap_or(0);

		if stored_version > latest.version() {
			return Err(Error::SchemaDowngrade {
				stored: stored_version,
				latest: latest.version(),
			});
		}

		let diff = diff(&history.at(stored_version)?, &latest);

		let needs_rebuild = if diff.is_empty() {
			false
		} else {
			info!(
				from = stored_version,
				to = latest.version(),
				"Migrating table store schema"
			);
			store.apply_diff(&diff, &latest).await?;
			reset_outdated_indexes(store.as_ref(), &diff, &latest).await?
		};

		if stored_version != latest.version() {
			store.set_schema_version(latest.version()).await?;
		}

		let indexer = Arc::new(Indexer::new(
			store,
			Tables::from_schema(&latest),
			EventBus::new(config.event_capacity),
		));

		let registry = Arc::new(ArchiveRegistry::new(
			indexer,
			opener,
			config.auto_download,
		));

		let load_passes = registry.load_archives(needs_rebuild).await?;

		debug!(
			schema_version = latest.version(),
			needs_rebuild,
			archives = load_passes.len(),
			"Database opened"
		);

		Ok(Self {
			registry,
			schema_version: latest.version(),
			load_passes,
		})
	}

	#[must_use]
	pub const fn schema_version(&self) -> u32 {
		self.schema_version
	}

	#[must_use]
	pub fn registry(&self) -> &Arc<ArchiveRegistry> {
		&self.registry
	}

	#[must_use]
	pub fn store(&self) -> &Arc<dyn TableStore> {
		self.registry.indexer().store()
	}

	#[must_use]
	pub fn tables(&self) -> &Tables {
		self.registry.indexer().tables()
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
		self.registry.indexer().events().subscribe()
	}

	/// Waits for the index passes scheduled when the database was opened.
	pub async fn wait_for_load(&mut self) {
		for pass in self.load_passes.drain(..) {
			match pass.await {
				Err(e) if e.is_panic() => error!(?e, "Archive load pass panicked;"),
				Err(_) => trace!("Archive load pass cancelled"),
				Ok(()) => {}
			}
		}
	}

	pub async fn add_archive(&self, archive: Arc<dyn Archive>) -> Result<(), RegistryError> {
		self.registry.add_archive(archive).await
	}

	pub async fn remove_archive(&self, url: &str) -> Result<(), RegistryError> {
		self.registry.remove_archive(url).await
	}

	pub async fn wait_till_indexed(&self, url: &str) -> Result<(), RegistryError> {
		self.registry.wait_till_indexed(url).await
	}

	pub async fn get_archive(&self, url: &str) -> Option<Arc<ArchiveHandle>> {
		self.registry.get_archive(url).await
	}

	/// Runs an index pass right away instead of waiting for the watcher.
	pub async fn index_archive(&self, url: &str) -> Result<IndexOutcome, RegistryError> {
		let archive = self
			.registry
			.get_archive(url)
			.await
			.ok_or_else(|| RegistryError::UnknownArchive(url.to_string()))?;

		Ok(self.registry.indexer().index_archive(&archive, false).await?)
	}

	/// Stops watching every archive. Records and index metadata stay in the store.
	pub async fn close(self) {
		self.registry.close().await;
	}
}
