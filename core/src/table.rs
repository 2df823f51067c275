use crate::archive::{Archive, ArchiveError};

use adb_schema::{IndexSpec, Schema, TableDefinition, ValidationError};

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
	pub table: String,
	pub path: String,
	pub record_url: String,
}

#[derive(Debug, Clone)]
pub struct Table {
	name: String,
	definition: TableDefinition,
}

impl Table {
	#[must_use]
	pub fn new(name: impl Into<String>, definition: TableDefinition) -> Self {
		Self {
			name: name.into(),
			definition,
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn index(&self) -> &[IndexSpec] {
		&self.definition.index
	}

	#[must_use]
	pub fn is_record_file(&self, path: &str) -> bool {
		self.definition.is_record_file(path)
	}

	/// Tables without a validator accept any content unchanged.
	pub fn validate(&self, content: Value) -> Result<Value, ValidationError> {
		match &self.definition.validator {
			Some(validator) => validator.validate(content),
			None => Ok(content),
		}
	}

	/// Files of `archive` this table would ingest, ignoring other tables.
	pub async fn list_record_files(
		&self,
		archive: &dyn Archive,
	) -> Result<Vec<RecordFile>, ArchiveError> {
		Ok(archive
			.list_files()
			.await?
			.into_iter()
			.filter(|path| self.is_record_file(path))
			.map(|path| self.record_file(archive.url(), path))
			.collect())
	}

	fn record_file(&self, archive_url: &str, path: String) -> RecordFile {
		RecordFile {
			table: self.name.clone(),
			record_url: crate::archive::record_url(archive_url, &path),
			path,
		}
	}
}

/// Tables in declaration order.
///
/// A path belongs to the first table whose file pattern matches it. Overlapping patterns are
/// not detected: the later table silently never sees the files claimed by the earlier one.
#[derive(Debug, Clone, Default)]
pub struct Tables {
	tables: Vec<Table>,
}

impl Tables {
	#[must_use]
	pub fn from_schema(schema: &Schema) -> Self {
		Self {
			tables: schema
				.tables()
				.map(|(name, definition)| Table::new(name, definition.clone()))
				.collect(),
		}
	}

	#[must_use]
	pub fn first_match(&self, path: &str) -> Option<&Table> {
		self.tables.iter().find(|table| table.is_record_file(path))
	}

	#[must_use]
	pub fn is_record_file(&self, path: &str) -> bool {
		self.first_match(path).is_some()
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<&Table> {
		self.tables.iter().find(|table| table.name == name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Table> {
		self.tables.iter()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.tables.iter().map(Table::name)
	}

	/// Union of every table's globs, used to filter archive activity streams.
	#[must_use]
	pub fn path_patterns(&self) -> Vec<String> {
		let mut patterns = Vec::new();

		for glob in self
			.tables
			.iter()
			.filter_map(|table| table.definition.file_pattern.as_ref())
			.flat_map(|pattern| pattern.globs())
		{
			if !patterns.contains(glob) {
				patterns.push(glob.clone());
			}
		}

		patterns
	}

	/// Every record file `archive` currently contributes, across all tables.
	pub async fn list_record_files(
		&self,
		archive: &dyn Archive,
	) -> Result<Vec<RecordFile>, ArchiveError> {
		Ok(archive
			.list_files()
			.await?
			.into_iter()
			.filter_map(|path| {
				self.first_match(&path)
					.map(|table| table.record_file(archive.url(), path))
			})
			.collect())
	}
}
