#![allow(clippy::unwrap_used, dead_code)]

use adb_core::{
	archive::{ArchiveInfo, HistoryEntry},
	memory::{MemoryArchive, MemoryStore},
	schema::{
		FilePattern, Schema, SchemaDiff, SchemaHistory, SchemaVersion, TableDefinition,
		ValidationError,
	},
	Archive, ArchiveError, EventBus, FileActivity, IndexMeta, Indexer, Record, StoreError,
	TableStore, Tables,
};

use std::{
	future::Future,
	ops::Range,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, timeout};

pub const ARCHIVE_URL: &str = "hyper://alice";

pub fn posts_v1() -> SchemaVersion {
	SchemaVersion::new(1).table(
		"posts",
		TableDefinition::new().with_file_pattern(FilePattern::new(["/posts/*.json"]).unwrap()),
	)
}

pub fn posts_history() -> SchemaHistory {
	SchemaHistory::new().with_version(posts_v1()).unwrap()
}

/// Posts must carry a string `title`.
pub fn validated_posts_history() -> SchemaHistory {
	posts_history().with_validator("posts", |record: Value| {
		if record.get("title").is_some_and(Value::is_string) {
			Ok(record)
		} else {
			Err(ValidationError::new("post is missing a title"))
		}
	})
}

/// A store with every table of `schema` created, as a freshly migrated database would have.
pub async fn migrated_store(schema: &Schema) -> Arc<MemoryStore> {
	let store = Arc::new(MemoryStore::new());

	store
		.apply_diff(&adb_core::schema::diff(&Schema::empty(), schema), schema)
		.await
		.unwrap();

	store
}

pub async fn indexer_for(history: &SchemaHistory) -> (Arc<Indexer>, Arc<MemoryStore>) {
	let schema = history.latest().unwrap();
	let store = migrated_store(&schema).await;

	let indexer = Arc::new(Indexer::new(
		Arc::clone(&store) as Arc<dyn TableStore>,
		Tables::from_schema(&schema),
		EventBus::default(),
	));

	(indexer, store)
}

pub async fn record_urls(store: &dyn TableStore, table: &str) -> Vec<String> {
	store
		.records(table)
		.await
		.unwrap()
		.into_iter()
		.map(|record| record.url)
		.collect()
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	timeout(Duration::from_secs(5), async {
		while !check().await {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition never held");
}

/// Flags passes that overlap. An index pass starts reading history and ends when it persists
/// its index metadata; an unindex pass starts listing files and ends when it drops the metadata.
#[derive(Debug, Default)]
pub struct PassTracker {
	in_pass: AtomicBool,
	pub passes: AtomicUsize,
	pub overlaps: AtomicUsize,
}

impl PassTracker {
	fn start(&self) {
		self.passes.fetch_add(1, Ordering::SeqCst);
		if self.in_pass.swap(true, Ordering::SeqCst) {
			self.overlaps.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn end(&self) {
		self.in_pass.store(false, Ordering::SeqCst);
	}
}

#[derive(Debug)]
pub struct TrackingArchive {
	pub inner: Arc<MemoryArchive>,
	pub tracker: Arc<PassTracker>,
}

#[async_trait]
impl Archive for TrackingArchive {
	fn url(&self) -> &str {
		self.inner.url()
	}

	async fn get_info(&self) -> Result<ArchiveInfo, ArchiveError> {
		self.inner.get_info().await
	}

	async fn read_file(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
		self.inner.read_file(path).await
	}

	async fn history(&self, range: Range<u64>) -> Result<Vec<HistoryEntry>, ArchiveError> {
		self.tracker.start();
		// Leave room for a concurrent pass to sneak in
		sleep(Duration::from_millis(5)).await;
		self.inner.history(range).await
	}

	async fn list_files(&self) -> Result<Vec<String>, ArchiveError> {
		self.tracker.start();
		sleep(Duration::from_millis(5)).await;
		self.inner.list_files().await
	}

	fn watch(&self, patterns: &[String]) -> Result<chan::Receiver<FileActivity>, ArchiveError> {
		self.inner.watch(patterns)
	}

	async fn download(&self, path: &str) -> Result<(), ArchiveError> {
		self.inner.download(path).await
	}
}

#[derive(Debug)]
pub struct TrackingStore {
	pub inner: Arc<MemoryStore>,
	pub tracker: Arc<PassTracker>,
}

#[async_trait]
impl TableStore for TrackingStore {
	fn is_open(&self) -> bool {
		self.inner.is_open()
	}

	async fn put(&self, table: &str, record: Record) -> Result<(), StoreError> {
		self.inner.put(table, record).await
	}

	async fn get(&self, table: &str, key: &str) -> Result<Option<Record>, StoreError> {
		self.inner.get(table, key).await
	}

	async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
		self.inner.delete(table, key).await
	}

	async fn clear(&self, table: &str) -> Result<(), StoreError> {
		self.inner.clear(table).await
	}

	async fn records(&self, table: &str) -> Result<Vec<Record>, StoreError> {
		self.inner.records(table).await
	}

	async fn apply_diff(&self, diff: &SchemaDiff, schema: &Schema) -> Result<(), StoreError> {
		self.inner.apply_diff(diff, schema).await
	}

	async fn schema_version(&self) -> Result<Option<u32>, StoreError> {
		self.inner.schema_version().await
	}

	async fn set_schema_version(&self, version: u32) -> Result<(), StoreError> {
		self.inner.set_schema_version(version).await
	}

	async fn get_index_meta(&self, url: &str) -> Result<Option<IndexMeta>, StoreError> {
		self.inner.get_index_meta(url).await
	}

	async fn put_index_meta(&self, meta: IndexMeta) -> Result<(), StoreError> {
		let res = self.inner.put_index_meta(meta).await;
		self.tracker.end();
		res
	}

	async fn delete_index_meta(&self, url: &str) -> Result<(), StoreError> {
		let res = self.inner.delete_index_meta(url).await;
		self.tracker.end();
		res
	}

	async fn list_index_meta(&self) -> Result<Vec<IndexMeta>, StoreError> {
		self.inner.list_index_meta().await
	}
}
