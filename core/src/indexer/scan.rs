use crate::{
	archive::{Archive, ArchiveError, HistoryEntry},
	table::Tables,
};

use adb_schema::normalize_path;

use std::{collections::BTreeMap, ops::Range};

use tracing::{debug, instrument};

/// Latest history entry per path relevant to some table within `range`.
///
/// Later entries overwrite earlier ones for the same path, so a file created, deleted and
/// recreated within one window is applied once, in its final state.
#[instrument(
	skip_all,
	fields(archive_url = %archive.url(), start = range.start, end = range.end),
	err,
)]
pub async fn scan_archive_history_for_updates(
	archive: &dyn Archive,
	tables: &Tables,
	range: Range<u64>,
) -> Result<BTreeMap<String, HistoryEntry>, ArchiveError> {
	let history = archive.history(range).await?;
	let scanned = history.len();

	let updates = history
		.into_iter()
		.filter(|entry| tables.is_record_file(&entry.path))
		.fold(BTreeMap::new(), |mut updates, entry| {
			updates.insert(normalize_path(&entry.path).into_owned(), entry);
			updates
		});

	debug!(scanned, updates = updates.len(), "Scanned archive history");

	Ok(updates)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use super::*;

	use crate::{archive::ChangeKind, memory::MemoryArchive};

	use adb_schema::{FilePattern, SchemaHistory, SchemaVersion, TableDefinition};

	use tracing_test::traced_test;

	fn tables() -> Tables {
		let schema = SchemaHistory::new()
			.with_version(SchemaVersion::new(1).table(
				"posts",
				TableDefinition::new()
					.with_file_pattern(FilePattern::new(["/posts/*.json"]).unwrap()),
			))
			.unwrap()
			.latest()
			.unwrap();

		Tables::from_schema(&schema)
	}

	#[tokio::test]
	#[traced_test]
	async fn latest_entry_per_path_wins() {
		let archive = MemoryArchive::new("hyper://a", true);

		archive.write_file("/posts/x.json", "{}"); // 1
		archive.write_file("/notes.txt", "hi"); // 2
		archive.write_file("/posts/x.json", "{}"); // 3
		archive.write_file("/posts/y.json", "{}"); // 4
		archive.write_file("/posts/x.json", "{}"); // 5
		archive.delete_file("/posts/y.json"); // 6

		let updates = scan_archive_history_for_updates(&archive, &tables(), 1..6)
			.await
			.unwrap();

		assert_eq!(updates.len(), 2);
		assert_eq!(updates["/posts/x.json"].version, 5);
		assert_eq!(updates["/posts/y.json"].kind, ChangeKind::Put);

		let updates = scan_archive_history_for_updates(&archive, &tables(), 5..7)
			.await
			.unwrap();

		assert_eq!(updates["/posts/y.json"].kind, ChangeKind::Del);
		assert!(!updates.contains_key("/notes.txt"));
	}
}
