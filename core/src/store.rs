//! The table store collaborator. Durability and querying live behind [`TableStore`]; the
//! indexer only needs keyed single-record operations, iteration, structural changes and
//! its own per-archive bookkeeping.

use adb_schema::{Schema, SchemaDiff};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("table store is closed")]
	Closed,
	#[error("unknown table: <name='{0}'>")]
	UnknownTable(String),
	#[error("table store backend error: {0}")]
	Backend(String),
}

/// The content of one ingested file plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	/// Archive URL joined with the file path, the record's key.
	#[serde(rename = "_url")]
	pub url: String,
	/// URL of the archive that contributed the record.
	#[serde(rename = "_origin")]
	pub origin: String,
	#[serde(flatten)]
	pub content: Map<String, Value>,
}

impl Record {
	/// Builds a record, dropping any provenance fields smuggled in by the file content.
	#[must_use]
	pub fn new(url: String, origin: String, mut content: Map<String, Value>) -> Self {
		content.remove("_url");
		content.remove("_origin");

		Self {
			url,
			origin,
			content,
		}
	}

	#[must_use]
	pub fn get(&self, field: &str) -> Option<&Value> {
		self.content.get(field)
	}
}

/// Per-archive bookkeeping of the last remote version fully indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
	pub url: String,
	pub version: u64,
	pub is_writable: bool,
}

impl IndexMeta {
	#[must_use]
	pub fn new(url: impl Into<String>, version: u64, is_writable: bool) -> Self {
		Self {
			url: url.into(),
			version,
			is_writable,
		}
	}
}

/// Single-record `put`/`delete` calls are expected to be atomic; nothing else is.
#[async_trait]
pub trait TableStore: Send + Sync + fmt::Debug + 'static {
	/// Whether the store can currently serve requests.
	fn is_open(&self) -> bool;

	/// Upserts `record` keyed by its URL.
	async fn put(&self, table: &str, record: Record) -> Result<(), StoreError>;

	async fn get(&self, table: &str, key: &str) -> Result<Option<Record>, StoreError>;

	/// Deleting a missing key is not an error.
	async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError>;

	async fn clear(&self, table: &str) -> Result<(), StoreError>;

	/// Every record of `table`.
	async fn records(&self, table: &str) -> Result<Vec<Record>, StoreError>;

	/// Creates, alters and drops tables and their indexes to go from the previous schema to
	/// `schema`.
	async fn apply_diff(&self, diff: &SchemaDiff, schema: &Schema) -> Result<(), StoreError>;

	async fn schema_version(&self) -> Result<Option<u32>, StoreError>;

	async fn set_schema_version(&self, version: u32) -> Result<(), StoreError>;

	async fn get_index_meta(&self, url: &str) -> Result<Option<IndexMeta>, StoreError>;

	async fn put_index_meta(&self, meta: IndexMeta) -> Result<(), StoreError>;

	async fn delete_index_meta(&self, url: &str) -> Result<(), StoreError>;

	async fn list_index_meta(&self) -> Result<Vec<IndexMeta>, StoreError>;
}
