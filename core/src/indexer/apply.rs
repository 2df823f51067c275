use crate::{
	archive::{ArchiveError, ArchiveHandle, ChangeKind, HistoryEntry},
	store::{Record, StoreError, TableStore},
	table::Tables,
};

use adb_schema::ValidationError;

use std::collections::BTreeMap;

use futures_concurrency::future::Join;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, trace, warn};

/// Failures confined to a single record file; they never abort the surrounding batch.
#[derive(Error, Debug)]
pub enum ApplyError {
	#[error("unable to read record file: {0}")]
	Read(#[from] ArchiveError),
	#[error("record file is not valid JSON: {0}")]
	Deserialize(#[from] serde_json::Error),
	#[error("record file content must be a JSON object")]
	NotAnObject,
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("table store error: {0}")]
	Store(#[from] StoreError),
}

/// Applies every update concurrently and returns, per path, the table it touched.
///
/// `None` means no table matched or the update failed; failures are logged and skipped, so
/// records already written for other paths stay written.
pub async fn apply_updates(
	store: &dyn TableStore,
	tables: &Tables,
	archive: &ArchiveHandle,
	updates: &BTreeMap<String, HistoryEntry>,
) -> Vec<Option<String>> {
	updates
		.iter()
		.map(|(path, update)| async move {
			let res = match update.kind {
				ChangeKind::Del => unindex_file(store, tables, archive, path).await,
				ChangeKind::Put => index_file(store, tables, archive, path).await,
			};

			match res {
				Ok(table) => table,
				Err(ApplyError::Validation(e)) => {
					warn!(%path, %e, "Record file rejected by table validator;");
					None
				}
				Err(e) => {
					error!(?e, %path, version = update.version, "Failed to apply record file update;");
					None
				}
			}
		})
		.collect::<Vec<_>>()
		.join()
		.await
}

async fn index_file(
	store: &dyn TableStore,
	tables: &Tables,
	archive: &ArchiveHandle,
	path: &str,
) -> Result<Option<String>, ApplyError> {
	let Some(table) = tables.first_match(path) else {
		return Ok(None);
	};

	let content = serde_json::from_slice::<Value>(&archive.read_file(path).await?)?;

	let Value::Object(content) = table.validate(content)? else {
		return Err(ApplyError::NotAnObject);
	};

	let record = Record::new(
		archive.record_url(path),
		archive.url().to_string(),
		content,
	);

	trace!(table = table.name(), record_url = %record.url, "Indexing record");

	store.put(table.name(), record).await?;

	Ok(Some(table.name().to_string()))
}

async fn unindex_file(
	store: &dyn TableStore,
	tables: &Tables,
	archive: &ArchiveHandle,
	path: &str,
) -> Result<Option<String>, ApplyError> {
	let Some(table) = tables.first_match(path) else {
		return Ok(None);
	};

	let record_url = archive.record_url(path);

	trace!(table = table.name(), %record_url, "Unindexing record");

	store.delete(table.name(), &record_url).await?;

	Ok(Some(table.name().to_string()))
}
