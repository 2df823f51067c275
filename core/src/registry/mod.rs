use crate::{
	archive::{Archive, ArchiveError, ArchiveHandle, ArchiveOpener},
	events::IndexEvent,
	indexer::{IndexOutcome, Indexer, IndexerError},
	store::{IndexMeta, StoreError},
};

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::{
	spawn,
	sync::{broadcast::error::RecvError, Mutex, RwLock},
	task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

mod watcher;

use watcher::ArchiveWatcher;

#[derive(Error, Debug)]
pub enum RegistryError {
	#[error("archive is not registered: <url='{0}'>")]
	UnknownArchive(String),
	#[error("archive was removed while waiting for it to be indexed: <url='{0}'>")]
	ArchiveRemoved(String),
	#[error("index event bus closed")]
	EventsClosed,
	#[error(transparent)]
	Archive(#[from] ArchiveError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Indexer(#[from] IndexerError),
}

/// Tracks the archives this database indexes, one live handle per URL, and keeps each of them
/// watched for changes.
#[derive(Debug)]
pub struct ArchiveRegistry {
	indexer: Arc<Indexer>,
	opener: Arc<dyn ArchiveOpener>,
	archives: RwLock<HashMap<String, Arc<ArchiveHandle>>>,
	watchers: Mutex<HashMap<String, ArchiveWatcher>>,
	load_passes: Mutex<HashMap<String, AbortHandle>>,
	auto_download: bool,
}

impl ArchiveRegistry {
	#[must_use]
	pub fn new(indexer: Arc<Indexer>, opener: Arc<dyn ArchiveOpener>, auto_download: bool) -> Self {
		Self {
			indexer,
			opener,
			archives: RwLock::default(),
			watchers: Mutex::default(),
			load_passes: Mutex::default(),
			auto_download,
		}
	}

	#[must_use]
	pub fn indexer(&self) -> &Arc<Indexer> {
		&self.indexer
	}

	/// Restores every archive with persisted index metadata and schedules an index pass for each.
	///
	/// Archives are registered and watched before this returns; the passes run in the
	/// background and the returned handles let callers wait for them.
	#[instrument(skip(self), err)]
	pub async fn load_archives(
		&self,
		needs_rebuild: bool,
	) -> Result<Vec<JoinHandle<()>>, RegistryError> {
		let metas = self.indexer.store().list_index_meta().await?;
		let mut passes = Vec::with_capacity(metas.len());

		for meta in metas {
			let archive = match self.opener.open(&meta.url) {
				Ok(archive) => archive,
				Err(e) => {
					error!(?e, archive_url = %meta.url, "Failed to open archive;");
					continue;
				}
			};

			let handle = Arc::new(ArchiveHandle::new(archive).with_writable(meta.is_writable));
			self.register(Arc::clone(&handle)).await;

			// Watch first, so changes landing while the pass runs queue another one
			if let Err(e) = self.watch_archive(&handle).await {
				error!(?e, archive_url = %meta.url, "Failed to watch archive;");
			}

			let indexer = Arc::clone(&self.indexer);
			let pass = spawn(
				async move {
					// Failures are already logged by the pass span
					let _ = indexer.index_archive(&handle, needs_rebuild).await;
				}
				.in_current_span(),
			);

			self.load_passes
				.lock()
				.await
				.insert(meta.url, pass.abort_handle());
			passes.push(pass);
		}

		info!(archives = passes.len(), "Loaded archives");

		Ok(passes)
	}

	/// Starts tracking `archive`: persists its metadata at version 0, indexes it fully and
	/// watches it. Adding an archive that is already tracked does nothing.
	#[instrument(skip_all, fields(archive_url = %archive.url()), err)]
	pub async fn add_archive(&self, archive: Arc<dyn Archive>) -> Result<(), RegistryError> {
		if self.get_archive(archive.url()).await.is_some() {
			debug!("Archive already registered");
			return Ok(());
		}

		let info = archive.get_info().await?;
		let handle = Arc::new(ArchiveHandle::new(archive).with_writable(info.is_owner));

		self.indexer
			.store()
			.put_index_meta(IndexMeta::new(handle.url(), 0, info.is_owner))
			.await?;

		self.register(Arc::clone(&handle)).await;
		self.watch_archive(&handle).await?;

		if let IndexOutcome::Indexed { version, tables, .. } =
			self.indexer.index_archive(&handle, false).await?
		{
			debug!(version, ?tables, "Added archive");
		}

		Ok(())
	}

	/// Stops tracking the archive and removes every record it contributed.
	///
	/// A load pass that hasn't taken the archive's lock yet is cancelled; one already running
	/// finishes before the records are removed.
	#[instrument(skip(self), err)]
	pub async fn remove_archive(&self, url: &str) -> Result<(), RegistryError> {
		self.unwatch_archive(url).await;

		if let Some(pass) = self.load_passes.lock().await.remove(url) {
			pass.abort();
		}

		let handle = self
			.archives
			.write()
			.await
			.remove(url)
			.ok_or_else(|| RegistryError::UnknownArchive(url.to_string()))?;

		self.indexer.unindex_archive(&handle).await?;

		info!("Removed archive");

		Ok(())
	}

	/// Indexes the archive whenever one of its record files changes. Watching an archive twice
	/// keeps the first subscription.
	#[instrument(skip_all, fields(archive_url = %archive.url()), err)]
	pub async fn watch_archive(&self, archive: &Arc<ArchiveHandle>) -> Result<(), RegistryError> {
		let mut watchers = self.watchers.lock().await;
		if watchers.contains_key(archive.url()) {
			trace!("Archive already watched");
			return Ok(());
		}

		let patterns = self.indexer.tables().path_patterns();
		if patterns.is_empty() {
			debug!("No table ingests archive files, nothing to watch");
			return Ok(());
		}

		let watcher = ArchiveWatcher::new(
			Arc::clone(archive),
			Arc::clone(&self.indexer),
			&patterns,
			self.auto_download,
		)?;

		watchers.insert(watcher.archive_url().to_string(), watcher);

		Ok(())
	}

	/// Returns whether a subscription was active. Waits for the passes it queued to be
	/// cancelled.
	pub async fn unwatch_archive(&self, url: &str) -> bool {
		let watcher = self.watchers.lock().await.remove(url);

		match watcher {
			Some(watcher) => {
				watcher.stop().await;
				true
			}
			None => false,
		}
	}

	/// Resolves once the indexed version of the archive reaches the version it has right now.
	///
	/// There is no timeout: an archive whose passes keep failing is waited on forever.
	#[instrument(skip(self), err)]
	pub async fn wait_till_indexed(&self, url: &str) -> Result<(), RegistryError> {
		let archive = self
			.get_archive(url)
			.await
			.ok_or_else(|| RegistryError::UnknownArchive(url.to_string()))?;

		// Subscribe before checking, so a pass finishing in between is still seen
		let mut events = self.indexer.events().subscribe();
		let target = archive.get_info().await?.version;

		loop {
			let indexed = self
				.indexer
				.store()
				.get_index_meta(url)
				.await?
				.map_or(0, |meta| meta.version);

			if indexed >= target {
				trace!(indexed, target, "Archive indexed");
				return Ok(());
			}

			loop {
				match events.recv().await {
					Ok(IndexEvent::IndexesUpdated {
						archive_url,
						version,
					}) if archive_url == url && version >= target => {
						trace!(version, target, "Archive indexed");
						return Ok(());
					}
					Ok(IndexEvent::ArchiveUnindexed { archive_url }) if archive_url == url => {
						return Err(RegistryError::ArchiveRemoved(archive_url));
					}
					Ok(_) => {}
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "Missed index events, checking persisted version");
						break;
					}
					Err(RecvError::Closed) => return Err(RegistryError::EventsClosed),
				}
			}
		}
	}

	pub async fn get_archive(&self, url: &str) -> Option<Arc<ArchiveHandle>> {
		self.archives.read().await.get(url).cloned()
	}

	pub async fn list_archives(&self) -> Vec<Arc<ArchiveHandle>> {
		self.archives.read().await.values().cloned().collect()
	}

	pub async fn is_watching(&self, url: &str) -> bool {
		self.watchers.lock().await.contains_key(url)
	}

	/// Stops every watcher; archives stay registered.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		let watchers = self
			.watchers
			.lock()
			.await
			.drain()
			.map(|(_, watcher)| watcher)
			.collect::<Vec<_>>();

		for watcher in watchers {
			watcher.stop().await;
		}

		debug!("Archive registry closed");
	}

	async fn register(&self, handle: Arc<ArchiveHandle>) {
		if let Some(previous) = self
			.archives
			.write()
			.await
			.insert(handle.url().to_string(), handle)
		{
			warn!(archive_url = %previous.url(), "Replaced registered archive handle");
		}
	}
}
