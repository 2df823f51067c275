//! In-memory archive and table store, for tests and for embedding the indexer without a
//! persistent backend.

use crate::{
	archive::{
		Archive, ArchiveError, ArchiveInfo, ArchiveOpener, ChangeKind, FileActivity, HistoryEntry,
	},
	store::{IndexMeta, Record, StoreError, TableStore},
};

use adb_schema::{normalize_path, FilePattern, IndexSpec, Schema, SchemaDiff};

use std::{
	collections::{BTreeMap, HashMap},
	ops::Range,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, MutexGuard, PoisonError,
	},
};

use async_channel as chan;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{trace, warn};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ArchiveState {
	files: BTreeMap<String, Vec<u8>>,
	history: Vec<HistoryEntry>,
	watchers: Vec<(FilePattern, chan::Sender<FileActivity>)>,
	downloads: Vec<String>,
	offline: bool,
}

/// An archive whose version is the length of its history: the first write is version 1.
#[derive(Debug)]
pub struct MemoryArchive {
	url: String,
	is_owner: bool,
	state: Mutex<ArchiveState>,
}

impl MemoryArchive {
	#[must_use]
	pub fn new(url: impl Into<String>, is_owner: bool) -> Self {
		Self {
			url: url.into(),
			is_owner,
			state: Mutex::default(),
		}
	}

	/// Writes a file and returns the new archive version.
	pub fn write_file(&self, path: &str, content: impl Into<Vec<u8>>) -> u64 {
		let path = normalize_path(path).into_owned();
		let mut state = locked(&self.state);

		state.files.insert(path.clone(), content.into());
		Self::append(&mut state, path, ChangeKind::Put)
	}

	pub fn write_json(&self, path: &str, value: &Value) -> u64 {
		self.write_file(path, value.to_string())
	}

	/// Deletes a file and returns the new archive version. Deleting a missing file still
	/// appends a history entry.
	pub fn delete_file(&self, path: &str) -> u64 {
		let path = normalize_path(path).into_owned();
		let mut state = locked(&self.state);

		state.files.remove(&path);
		Self::append(&mut state, path, ChangeKind::Del)
	}

	/// Tells watchers the local copy of `path` went stale.
	pub fn invalidate(&self, path: &str) {
		let mut state = locked(&self.state);
		Self::notify(
			&mut state,
			&FileActivity::Invalidated {
				path: normalize_path(path).into_owned(),
			},
		);
	}

	/// While offline every read fails with [`ArchiveError::Unavailable`].
	pub fn set_offline(&self, offline: bool) {
		locked(&self.state).offline = offline;
	}

	#[must_use]
	pub fn version(&self) -> u64 {
		locked(&self.state).history.len() as u64
	}

	#[must_use]
	pub fn downloads(&self) -> Vec<String> {
		locked(&self.state).downloads.clone()
	}

	#[must_use]
	pub fn watcher_count(&self) -> usize {
		let mut state = locked(&self.state);
		state.watchers.retain(|(_, tx)| !tx.is_closed());
		state.watchers.len()
	}

	fn append(state: &mut ArchiveState, path: String, kind: ChangeKind) -> u64 {
		let version = state.history.len() as u64 + 1;

		state.history.push(HistoryEntry {
			path: path.clone(),
			kind,
			version,
		});

		Self::notify(state, &FileActivity::Changed { path });

		version
	}

	fn notify(state: &mut ArchiveState, activity: &FileActivity) {
		state.watchers.retain(|(pattern, tx)| {
			if !pattern.matches(activity.path()) {
				return !tx.is_closed();
			}

			// Unbounded, so this only fails once the subscriber is gone
			tx.try_send(activity.clone()).is_ok()
		});
	}

	fn check_online(&self) -> Result<MutexGuard<'_, ArchiveState>, ArchiveError> {
		let state = locked(&self.state);
		if state.offline {
			return Err(ArchiveError::Unavailable(format!(
				"archive <url='{}'> is offline",
				self.url
			)));
		}

		Ok(state)
	}
}

#[async_trait]
impl Archive for MemoryArchive {
	fn url(&self) -> &str {
		&self.url
	}

	async fn get_info(&self) -> Result<ArchiveInfo, ArchiveError> {
		let state = self.check_online()?;

		Ok(ArchiveInfo {
			version: state.history.len() as u64,
			is_owner: self.is_owner,
		})
	}

	async fn read_file(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
		self.check_online()?
			.files
			.get(normalize_path(path).as_ref())
			.cloned()
			.ok_or_else(|| ArchiveError::FileNotFound(path.to_string()))
	}

	async fn history(&self, range: Range<u64>) -> Result<Vec<HistoryEntry>, ArchiveError> {
		Ok(self
			.check_online()?
			.history
			.iter()
			.filter(|entry| range.contains(&entry.version))
			.cloned()
			.collect())
	}

	async fn list_files(&self) -> Result<Vec<String>, ArchiveError> {
		Ok(self.check_online()?.files.keys().cloned().collect())
	}

	fn watch(&self, patterns: &[String]) -> Result<chan::Receiver<FileActivity>, ArchiveError> {
		let pattern = FilePattern::new(patterns.iter().cloned())
			.map_err(|e| ArchiveError::Watch(e.to_string()))?;

		let (tx, rx) = chan::unbounded();
		locked(&self.state).watchers.push((pattern, tx));

		Ok(rx)
	}

	async fn download(&self, path: &str) -> Result<(), ArchiveError> {
		let mut state = self.check_online()?;
		state.downloads.push(normalize_path(path).into_owned());

		trace!(archive_url = %self.url, %path, "Downloaded file");

		Ok(())
	}
}

/// Archives reachable by URL, standing in for the replication network.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
	archives: Mutex<HashMap<String, Arc<MemoryArchive>>>,
}

impl MemoryNetwork {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_archive(&self, url: impl Into<String>, is_owner: bool) -> Arc<MemoryArchive> {
		let archive = Arc::new(MemoryArchive::new(url, is_owner));

		locked(&self.archives).insert(archive.url().to_string(), Arc::clone(&archive));

		archive
	}

	#[must_use]
	pub fn get(&self, url: &str) -> Option<Arc<MemoryArchive>> {
		locked(&self.archives).get(url).cloned()
	}
}

impl ArchiveOpener for MemoryNetwork {
	fn open(&self, url: &str) -> Result<Arc<dyn Archive>, ArchiveError> {
		self.get(url)
			.map(|archive| -> Arc<dyn Archive> { archive })
			.ok_or_else(|| ArchiveError::ArchiveNotFound(url.to_string()))
	}
}

#[derive(Debug, Default)]
struct MemoryTable {
	indexes: Vec<IndexSpec>,
	records: BTreeMap<String, Record>,
}

#[derive(Debug, Default)]
struct StoreState {
	tables: BTreeMap<String, MemoryTable>,
	index_meta: BTreeMap<String, IndexMeta>,
	schema_version: Option<u32>,
}

/// A table store kept in memory; survives as long as the value does, so reopening a database
/// on the same store behaves like restarting on a persistent one.
#[derive(Debug, Default)]
pub struct MemoryStore {
	state: Mutex<StoreState>,
	closed: AtomicBool,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}

	pub fn reopen(&self) {
		self.closed.store(false, Ordering::Release);
	}

	#[must_use]
	pub fn table_names(&self) -> Vec<String> {
		locked(&self.state).tables.keys().cloned().collect()
	}

	#[must_use]
	pub fn indexes(&self, table: &str) -> Option<Vec<IndexSpec>> {
		locked(&self.state)
			.tables
			.get(table)
			.map(|table| table.indexes.clone())
	}

	fn state(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(StoreError::Closed);
		}

		Ok(locked(&self.state))
	}
}

fn table_mut<'state>(
	state: &'state mut StoreState,
	table: &str,
) -> Result<&'state mut MemoryTable, StoreError> {
	state
		.tables
		.get_mut(table)
		.ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

#[async_trait]
impl TableStore for MemoryStore {
	fn is_open(&self) -> bool {
		!self.closed.load(Ordering::Acquire)
	}

	async fn put(&self, table: &str, record: Record) -> Result<(), StoreError> {
		table_mut(&mut *self.state()?, table)?
			.records
			.insert(record.url.clone(), record);

		Ok(())
	}

	async fn get(&self, table: &str, key: &str) -> Result<Option<Record>, StoreError> {
		Ok(table_mut(&mut *self.state()?, table)?.records.get(key).cloned())
	}

	async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
		table_mut(&mut *self.state()?, table)?.records.remove(key);
		Ok(())
	}

	async fn clear(&self, table: &str) -> Result<(), StoreError> {
		table_mut(&mut *self.state()?, table)?.records.clear();
		Ok(())
	}

	async fn records(&self, table: &str) -> Result<Vec<Record>, StoreError> {
		Ok(table_mut(&mut *self.state()?, table)?
			.records
			.values()
			.cloned()
			.collect())
	}

	async fn apply_diff(&self, diff: &SchemaDiff, schema: &Schema) -> Result<(), StoreError> {
		let mut state = self.state()?;

		for name in &diff.tables_to_remove {
			state.tables.remove(name);
		}

		for name in diff.tables_to_add.iter().chain(diff.tables_to_change.keys()) {
			let Some(definition) = schema.get(name) else {
				warn!(table = %name, "Schema diff names a table missing from the schema");
				continue;
			};

			state.tables.entry(name.clone()).or_default().indexes = definition.index.clone();
		}

		Ok(())
	}

	async fn schema_version(&self) -> Result<Option<u32>, StoreError> {
		Ok(self.state()?.schema_version)
	}

	async fn set_schema_version(&self, version: u32) -> Result<(), StoreError> {
		self.state()?.schema_version = Some(version);
		Ok(())
	}

	async fn get_index_meta(&self, url: &str) -> Result<Option<IndexMeta>, StoreError> {
		Ok(self.state()?.index_meta.get(url).cloned())
	}

	async fn put_index_meta(&self, meta: IndexMeta) -> Result<(), StoreError> {
		self.state()?.index_meta.insert(meta.url.clone(), meta);
		Ok(())
	}

	async fn delete_index_meta(&self, url: &str) -> Result<(), StoreError> {
		self.state()?.index_meta.remove(url);
		Ok(())
	}

	async fn list_index_meta(&self) -> Result<Vec<IndexMeta>, StoreError> {
		Ok(self.state()?.index_meta.values().cloned().collect())
	}
}
