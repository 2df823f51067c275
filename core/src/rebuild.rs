use crate::store::{IndexMeta, StoreError, TableStore};

use adb_schema::{Schema, SchemaDiff};

use tracing::{debug, info, instrument};

/// Clears the tables `diff` flags for rebuild, along with every table declared after the first
/// of them, and rewinds every archive to version 0 so the next pass replays each archive's whole
/// history.
///
/// A file belongs to the first table whose pattern matches it, so a changed pattern can move
/// files into or out of any later table. Tables declared before the first flagged one keep their
/// records and simply see them rewritten by the replay.
///
/// Returns whether anything was reset.
#[instrument(skip_all, fields(tables = ?diff.tables_to_rebuild), err)]
pub async fn reset_outdated_indexes(
	store: &dyn TableStore,
	diff: &SchemaDiff,
	schema: &Schema,
) -> Result<bool, StoreError> {
	if !diff.needs_rebuild() {
		return Ok(false);
	}

	for table in schema
		.tables()
		.map(|(name, _)| name)
		.skip_while(|name| !diff.tables_to_rebuild.contains(*name))
	{
		debug!(%table, "Clearing table for rebuild");
		store.clear(table).await?;
	}

	let metas = store.list_index_meta().await?;
	let archives = metas.len();

	for IndexMeta {
		url, is_writable, ..
	} in metas
	{
		store
			.put_index_meta(IndexMeta::new(url, 0, is_writable))
			.await?;
	}

	info!(archives, "Reset indexed versions for rebuild");

	Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use super::*;

	use crate::{memory::MemoryStore, store::Record};

	use adb_schema::{diff, FilePattern, SchemaHistory, SchemaVersion, TableDefinition};

	use std::collections::BTreeSet;

	use serde_json::Map;
	use tracing_test::traced_test;

	fn history() -> SchemaHistory {
		SchemaHistory::new()
			.with_version(
				SchemaVersion::new(1)
					.table(
						"profile",
						TableDefinition::new()
							.with_file_pattern(FilePattern::new(["/profile.json"]).unwrap()),
					)
					.table(
						"posts",
						TableDefinition::new()
							.with_file_pattern(FilePattern::new(["/posts/*.json"]).unwrap()),
					)
					.table(
						"media",
						TableDefinition::new()
							.with_file_pattern(FilePattern::new(["/**/*.json"]).unwrap()),
					),
			)
			.unwrap()
			.with_version(SchemaVersion::new(2).table(
				"posts",
				TableDefinition::new()
					.with_file_pattern(FilePattern::new(["/entries/*.json"]).unwrap()),
			))
			.unwrap()
	}

	async fn store_at_v1(history: &SchemaHistory) -> MemoryStore {
		let store = MemoryStore::new();
		let v1 = history.at(1).unwrap();
		store.apply_diff(&diff(&Schema::empty(), &v1), &v1).await.unwrap();

		for table in ["profile", "posts", "media"] {
			store
				.put(
					table,
					Record::new(
						format!("hyper://a/{table}"),
						"hyper://a".into(),
						Map::new(),
					),
				)
				.await
				.unwrap();
		}

		store
			.put_index_meta(IndexMeta::new("hyper://a", 7, true))
			.await
			.unwrap();

		store
	}

	#[tokio::test]
	#[traced_test]
	async fn clears_flagged_tables_and_those_declared_after() {
		let history = history();
		let store = store_at_v1(&history).await;

		let latest = history.latest().unwrap();
		let diff = diff(&history.at(1).unwrap(), &latest);
		assert_eq!(diff.tables_to_rebuild, BTreeSet::from(["posts".to_string()]));

		assert!(reset_outdated_indexes(&store, &diff, &latest).await.unwrap());

		assert_eq!(store.records("profile").await.unwrap().len(), 1);
		assert!(store.records("posts").await.unwrap().is_empty());
		// Unchanged, but files the old posts pattern claimed now fall through to it
		assert!(store.records("media").await.unwrap().is_empty());
		assert_eq!(
			store.get_index_meta("hyper://a").await.unwrap(),
			Some(IndexMeta::new("hyper://a", 0, true))
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn nothing_flagged_leaves_versions() {
		let history = history();
		let store = store_at_v1(&history).await;

		let v1 = history.at(1).unwrap();
		let diff = diff(&v1, &v1);

		assert!(!reset_outdated_indexes(&store, &diff, &v1).await.unwrap());
		assert_eq!(
			store
				.get_index_meta("hyper://a")
				.await
				.unwrap()
				.map(|meta| meta.version),
			Some(7)
		);
	}
}
