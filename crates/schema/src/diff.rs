use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{IndexSpec, Schema};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChanges {
	pub added: Vec<IndexSpec>,
	pub removed: Vec<IndexSpec>,
}

impl IndexChanges {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty()
	}
}

/// Structural changes between two schemas, plus the tables whose stored records can no longer
/// be trusted and must be rebuilt from archive history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
	pub tables_to_add: BTreeSet<String>,
	pub tables_to_change: BTreeMap<String, IndexChanges>,
	pub tables_to_remove: BTreeSet<String>,
	pub tables_to_rebuild: BTreeSet<String>,
}

impl SchemaDiff {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.tables_to_add.is_empty()
			&& self.tables_to_change.is_empty()
			&& self.tables_to_remove.is_empty()
			&& self.tables_to_rebuild.is_empty()
	}

	#[must_use]
	pub fn needs_rebuild(&self) -> bool {
		!self.tables_to_rebuild.is_empty()
	}
}

/// Compares two effective schemas.
///
/// New tables are always rebuilt since they have no data yet; tables whose file pattern changed
/// are rebuilt because their records were selected by the old pattern.
#[must_use]
pub fn diff(old: &Schema, new: &Schema) -> SchemaDiff {
	let mut diff = SchemaDiff::default();

	diff.tables_to_remove.extend(
		old.table_names()
			.filter(|name| new.get(name).is_none())
			.map(ToString::to_string),
	);

	for (name, new_table) in new.tables() {
		let Some(old_table) = old.get(name) else {
			diff.tables_to_add.insert(name.to_string());
			diff.tables_to_rebuild.insert(name.to_string());
			continue;
		};

		let changes = IndexChanges {
			added: new_table
				.index
				.iter()
				.filter(|spec| !old_table.index.contains(spec))
				.cloned()
				.collect(),
			removed: old_table
				.index
				.iter()
				.filter(|spec| !new_table.index.contains(spec))
				.cloned()
				.collect(),
		};

		if !changes.is_empty() {
			diff.tables_to_change.insert(name.to_string(), changes);
		}

		if old_table.file_pattern != new_table.file_pattern {
			diff.tables_to_rebuild.insert(name.to_string());
		}
	}

	debug!(
		from = old.version(),
		to = new.version(),
		add = diff.tables_to_add.len(),
		change = diff.tables_to_change.len(),
		remove = diff.tables_to_remove.len(),
		rebuild = diff.tables_to_rebuild.len(),
		"Computed schema diff",
	);

	diff
}
