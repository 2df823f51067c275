#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

mod definition;
mod diff;

pub use definition::{
	normalize_path, FilePattern, IndexSpec, RecordValidator, TableDefinition, ValidationError,
};
pub use diff::{diff, IndexChanges, SchemaDiff};

/// Configuration errors, raised when a schema is registered and fatal to that registration.
#[derive(Error, Debug)]
pub enum SchemaError {
	#[error("schema declaration must be a JSON object")]
	NotAnObject,
	#[error("schema history must be a JSON array of declarations")]
	NotAnArray,
	#[error("schema declaration is missing its version")]
	MissingVersion,
	#[error("schema version must be a positive integer: <version='{0}'>")]
	InvalidVersion(Value),
	#[error("schema versions must be strictly increasing: <previous={previous}, version={version}>")]
	NonIncreasingVersion { previous: u32, version: u32 },
	#[error("unknown schema version: <version={0}>")]
	UnknownVersion(u32),
	#[error("`tables` must map table names to definitions or null")]
	InvalidTables,
	#[error("invalid table name: <name='{0}'>")]
	InvalidTableName(String),
	#[error("invalid definition for table <name='{table}'>: {reason}")]
	InvalidTable { table: String, reason: String },
	#[error("validator registered for unknown table: <name='{0}'>")]
	UnknownTable(String),
	#[error("malformed index specifier <spec='{spec}'>: {reason}")]
	MalformedIndex { spec: String, reason: &'static str },
	#[error("file pattern needs at least one glob")]
	EmptyFilePattern,
	#[error("invalid file pattern glob <glob='{glob}'>: {source}")]
	InvalidGlob {
		glob: String,
		#[source]
		source: globset::Error,
	},
}

/// Tables declared, changed or removed (`None`) by one schema version.
///
/// Tables a version doesn't mention keep whatever the previous version declared.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
	pub version: u32,
	pub tables: IndexMap<String, Option<TableDefinition>>,
}

impl SchemaVersion {
	#[must_use]
	pub fn new(version: u32) -> Self {
		Self {
			version,
			tables: IndexMap::new(),
		}
	}

	#[must_use]
	pub fn table(mut self, name: impl Into<String>, definition: TableDefinition) -> Self {
		self.tables.insert(name.into(), Some(definition));
		self
	}

	#[must_use]
	pub fn remove_table(mut self, name: impl Into<String>) -> Self {
		self.tables.insert(name.into(), None);
		self
	}

	/// Parses a declaration shaped like
	/// `{"version": 2, "tables": {"posts": {"filePattern": "/posts/*.json", "index": ["title"]}, "old": null}}`.
	pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
		let declaration = value.as_object().ok_or(SchemaError::NotAnObject)?;

		let raw_version = declaration
			.get("version")
			.ok_or(SchemaError::MissingVersion)?;

		let version = raw_version
			.as_u64()
			.and_then(|version| u32::try_from(version).ok())
			.filter(|version| *version > 0)
			.ok_or_else(|| SchemaError::InvalidVersion(raw_version.clone()))?;

		let tables = match declaration.get("tables") {
			None | Some(Value::Null) => IndexMap::new(),
			Some(Value::Object(tables)) => tables
				.iter()
				.map(|(name, definition)| {
					let definition = match definition {
						Value::Null => None,
						definition => Some(
							serde_json::from_value::<TableDefinition>(definition.clone()).map_err(
								|e| SchemaError::InvalidTable {
									table: name.clone(),
									reason: e.to_string(),
								},
							)?,
						),
					};

					Ok::<_, SchemaError>((name.clone(), definition))
				})
				.collect::<Result<_, SchemaError>>()?,
			Some(_) => return Err(SchemaError::InvalidTables),
		};

		let declaration = Self { version, tables };
		declaration.check()?;

		Ok(declaration)
	}

	fn check(&self) -> Result<(), SchemaError> {
		if self.version == 0 {
			return Err(SchemaError::InvalidVersion(Value::from(0)));
		}

		// Names starting with `_` are reserved for the store's own bookkeeping
		if let Some(name) = self
			.tables
			.keys()
			.find(|name| name.trim().is_empty() || name.starts_with('_'))
		{
			return Err(SchemaError::InvalidTableName(name.clone()));
		}

		Ok(())
	}
}

/// The effective set of tables at some schema version, in declaration order.
///
/// Declaration order is significant: a file is ingested into the first table whose file
/// pattern matches it.
#[derive(Debug, Clone, Default)]
pub struct Schema {
	version: u32,
	tables: IndexMap<String, TableDefinition>,
}

impl Schema {
	/// The schema of a store that was never initialized.
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	#[must_use]
	pub const fn version(&self) -> u32 {
		self.version
	}

	#[must_use]
	pub fn get(&self, name: &str) -> Option<&TableDefinition> {
		self.tables.get(name)
	}

	pub fn tables(&self) -> impl Iterator<Item = (&str, &TableDefinition)> {
		self.tables
			.iter()
			.map(|(name, definition)| (name.as_str(), definition))
	}

	pub fn table_names(&self) -> impl Iterator<Item = &str> {
		self.tables.keys().map(String::as_str)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.tables.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.tables.is_empty()
	}

	fn apply(&mut self, declaration: &SchemaVersion) {
		for (name, definition) in &declaration.tables {
			match definition {
				Some(definition) => {
					// Redeclared tables keep their original position
					self.tables.insert(name.clone(), definition.clone());
				}
				None => {
					self.tables.shift_remove(name);
				}
			}
		}

		self.version = declaration.version;
	}
}

/// Every schema version an application ever declared, oldest first.
#[derive(Default, Clone)]
pub struct SchemaHistory {
	versions: Vec<SchemaVersion>,
	validators: HashMap<String, Arc<dyn RecordValidator>>,
}

impl std::fmt::Debug for SchemaHistory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SchemaHistory")
			.field("versions", &self.versions)
			.field("validators", &self.validators.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl SchemaHistory {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Parses a JSON array of version declarations, see [`SchemaVersion::from_json`].
	pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
		let declarations = value.as_array().ok_or(SchemaError::NotAnArray)?;

		declarations
			.iter()
			.try_fold(Self::new(), |history, declaration| {
				history.with_version(SchemaVersion::from_json(declaration)?)
			})
	}

	pub fn define(&mut self, declaration: SchemaVersion) -> Result<&mut Self, SchemaError> {
		declaration.check()?;

		if let Some(previous) = self.latest_version() {
			if declaration.version <= previous {
				return Err(SchemaError::NonIncreasingVersion {
					previous,
					version: declaration.version,
				});
			}
		}

		trace!(
			version = declaration.version,
			tables = declaration.tables.len(),
			"Registered schema version"
		);

		self.versions.push(declaration);

		Ok(self)
	}

	pub fn with_version(mut self, declaration: SchemaVersion) -> Result<Self, SchemaError> {
		self.define(declaration)?;
		Ok(self)
	}

	/// Attaches a validator to a table for every version it appears in, so validators don't have
	/// to be repeated in each declaration.
	#[must_use]
	pub fn with_validator(mut self, table: impl Into<String>, validator: impl RecordValidator) -> Self {
		self.validators.insert(table.into(), Arc::new(validator));
		self
	}

	#[must_use]
	pub fn latest_version(&self) -> Option<u32> {
		self.versions.last().map(|declaration| declaration.version)
	}

	#[must_use]
	pub fn versions(&self) -> &[SchemaVersion] {
		&self.versions
	}

	/// The effective schema right after `version` was applied. Version 0 is the empty schema.
	pub fn at(&self, version: u32) -> Result<Schema, SchemaError> {
		if version != 0
			&& !self
				.versions
				.iter()
				.any(|declaration| declaration.version == version)
		{
			return Err(SchemaError::UnknownVersion(version));
		}

		let mut schema = self
			.versions
			.iter()
			.take_while(|declaration| declaration.version <= version)
			.fold(Schema::empty(), |mut schema, declaration| {
				schema.apply(declaration);
				schema
			});

		for (name, definition) in &mut schema.tables {
			if let Some(validator) = self.validators.get(name) {
				definition.validator = Some(Arc::clone(validator));
			}
		}

		Ok(schema)
	}

	/// The effective schema at the newest declared version.
	pub fn latest(&self) -> Result<Schema, SchemaError> {
		let schema = self.at(self.latest_version().unwrap_or_default())?;

		if let Some(name) = self
			.validators
			.keys()
			.find(|name| schema.get(name).is_none())
		{
			return Err(SchemaError::UnknownTable(name.clone()));
		}

		Ok(schema)
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn parses_declarations_in_order() {
		let declaration = SchemaVersion::from_json(&json!({
			"version": 1,
			"tables": {
				"profile": {"filePattern": "/profile.json"},
				"posts": {"filePattern": ["/posts/*.json"], "index": ["createdAt", "*tags"]},
				"gone": null,
			}
		}))
		.unwrap();

		assert_eq!(declaration.version, 1);
		assert_eq!(
			declaration.tables.keys().collect::<Vec<_>>(),
			["profile", "posts", "gone"]
		);
		assert!(declaration.tables["gone"].is_none());

		let posts = declaration.tables["posts"].as_ref().unwrap();
		assert!(posts.is_record_file("/posts/a.json"));
		assert_eq!(posts.index.len(), 2);
	}

	#[test]
	fn rejects_bad_versions() {
		assert!(matches!(
			SchemaVersion::from_json(&json!({"tables": {}})),
			Err(SchemaError::MissingVersion)
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": "2"})),
			Err(SchemaError::InvalidVersion(_))
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 0})),
			Err(SchemaError::InvalidVersion(_))
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 1.5})),
			Err(SchemaError::InvalidVersion(_))
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!([1])),
			Err(SchemaError::NotAnObject)
		));
	}

	#[test]
	fn rejects_bad_tables() {
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 1, "tables": {"posts": {"index": ["a++b"]}}})),
			Err(SchemaError::InvalidTable { table, .. }) if table == "posts"
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 1, "tables": {"posts": {"nope": 1}}})),
			Err(SchemaError::InvalidTable { .. })
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 1, "tables": {"_meta": {}}})),
			Err(SchemaError::InvalidTableName(_))
		));
		assert!(matches!(
			SchemaVersion::from_json(&json!({"version": 1, "tables": []})),
			Err(SchemaError::InvalidTables)
		));
	}

	#[test]
	fn versions_must_increase() {
		let mut history = SchemaHistory::new();
		history.define(SchemaVersion::new(2)).unwrap();

		assert!(matches!(
			history.define(SchemaVersion::new(2)),
			Err(SchemaError::NonIncreasingVersion {
				previous: 2,
				version: 2
			})
		));
		assert!(history.define(SchemaVersion::new(3)).is_ok());
		assert!(matches!(history.at(1), Err(SchemaError::UnknownVersion(1))));
	}

	#[test]
	fn history_accumulates_declarations() {
		let history = SchemaHistory::from_json(&json!([
			{"version": 1, "tables": {"posts": {"filePattern": "/posts/*.json"}, "likes": {}}},
			{"version": 2, "tables": {"likes": null, "profile": {"filePattern": "/profile.json"}}},
			{"version": 3, "tables": {"posts": {"filePattern": "/entries/*.json"}}},
		]))
		.unwrap()
		.with_validator("posts", |record: Value| Ok::<_, ValidationError>(record));

		assert_eq!(history.at(0).unwrap().len(), 0);
		assert_eq!(
			history.at(1).unwrap().table_names().collect::<Vec<_>>(),
			["posts", "likes"]
		);
		assert_eq!(
			history.at(2).unwrap().table_names().collect::<Vec<_>>(),
			["posts", "profile"]
		);

		let latest = history.latest().unwrap();
		assert_eq!(latest.version(), 3);
		assert_eq!(latest.table_names().collect::<Vec<_>>(), ["posts", "profile"]);
		assert!(latest.get("posts").unwrap().is_record_file("/entries/a.json"));
		assert!(latest.get("posts").unwrap().validator.is_some());
		assert!(latest.get("profile").unwrap().validator.is_none());
	}

	#[test]
	fn validators_need_a_table() {
		let history = SchemaHistory::new()
			.with_version(SchemaVersion::new(1).table("posts", TableDefinition::new()))
			.unwrap()
			.with_validator("comments", |record: Value| Ok::<_, ValidationError>(record));

		assert!(matches!(
			history.latest(),
			Err(SchemaError::UnknownTable(name)) if name == "comments"
		));
	}
}
