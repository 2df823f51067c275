use std::{borrow::Cow, fmt, str::FromStr, sync::Arc};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SchemaError;

/// One or more globs deciding which archive files belong to a table.
///
/// Paths are matched from the archive root, always with a leading `/`, and `*` never crosses
/// a directory separator, so `/posts/*.json` matches `/posts/a.json` but not
/// `/posts/drafts/a.json`. Use `**` to descend.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "OneOrMany", into = "Vec<String>")]
pub struct FilePattern {
	globs: Vec<String>,
	set: GlobSet,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
	One(String),
	Many(Vec<String>),
}

impl FilePattern {
	pub fn new<I, S>(globs: I) -> Result<Self, SchemaError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let globs = globs
			.into_iter()
			.map(|glob| {
				let glob: String = glob.into();
				normalize_path(&glob).into_owned()
			})
			.collect::<Vec<_>>();

		if globs.is_empty() {
			return Err(SchemaError::EmptyFilePattern);
		}

		let mut builder = GlobSetBuilder::new();
		for glob in &globs {
			builder.add(
				GlobBuilder::new(glob)
					.literal_separator(true)
					.build()
					.map_err(|source| SchemaError::InvalidGlob {
						glob: glob.clone(),
						source,
					})?,
			);
		}

		let set = builder.build().map_err(|source| SchemaError::InvalidGlob {
			glob: globs.join(", "),
			source,
		})?;

		Ok(Self { globs, set })
	}

	#[must_use]
	pub fn globs(&self) -> &[String] {
		&self.globs
	}

	#[must_use]
	pub fn matches(&self, path: &str) -> bool {
		self.set.is_match(normalize_path(path).as_ref())
	}
}

impl TryFrom<OneOrMany> for FilePattern {
	type Error = SchemaError;

	fn try_from(globs: OneOrMany) -> Result<Self, Self::Error> {
		match globs {
			OneOrMany::One(glob) => Self::new([glob]),
			OneOrMany::Many(globs) => Self::new(globs),
		}
	}
}

impl From<FilePattern> for Vec<String> {
	fn from(pattern: FilePattern) -> Self {
		pattern.globs
	}
}

impl PartialEq for FilePattern {
	fn eq(&self, other: &Self) -> bool {
		self.globs == other.globs
	}
}

impl Eq for FilePattern {}

impl fmt::Debug for FilePattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("FilePattern").field(&self.globs).finish()
	}
}

/// Archive paths are rooted; `posts/a.json` and `/posts/a.json` name the same file.
#[must_use]
pub fn normalize_path(path: &str) -> Cow<'_, str> {
	if path.starts_with('/') {
		Cow::Borrowed(path)
	} else {
		Cow::Owned(format!("/{path}"))
	}
}

/// A declared index over record fields.
///
/// Written as `title` or `author.name` for a single key path, `author+createdAt` for a
/// compound index and `*tags` for a multi-entry index over an array field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IndexSpec {
	Single(String),
	Compound(Vec<String>),
	MultiEntry(String),
}

impl FromStr for IndexSpec {
	type Err = SchemaError;

	fn from_str(spec: &str) -> Result<Self, Self::Err> {
		let malformed = |reason| SchemaError::MalformedIndex {
			spec: spec.to_string(),
			reason,
		};

		let trimmed = spec.trim();
		if trimmed.is_empty() {
			return Err(malformed("empty index specifier"));
		}

		if let Some(field) = trimmed.strip_prefix('*') {
			if field.contains('+') {
				return Err(malformed("multi-entry indexes can't be compound"));
			}
			check_key_path(field).map_err(malformed)?;
			return Ok(Self::MultiEntry(field.to_string()));
		}

		if trimmed.contains('+') {
			let fields = trimmed
				.split('+')
				.map(|field| check_key_path(field).map(|()| field.to_string()))
				.collect::<Result<Vec<_>, _>>()
				.map_err(malformed)?;

			if fields.len() < 2 {
				return Err(malformed("compound index needs at least two fields"));
			}

			return Ok(Self::Compound(fields));
		}

		check_key_path(trimmed).map_err(malformed)?;
		Ok(Self::Single(trimmed.to_string()))
	}
}

fn check_key_path(path: &str) -> Result<(), &'static str> {
	if path.is_empty() {
		return Err("empty key path");
	}

	for segment in path.split('.') {
		if segment.is_empty() {
			return Err("empty key path segment");
		}

		if !segment
			.chars()
			.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '$'))
		{
			return Err("key paths may only contain letters, digits, `_`, `-` and `$`");
		}
	}

	Ok(())
}

impl TryFrom<String> for IndexSpec {
	type Error = SchemaError;

	fn try_from(spec: String) -> Result<Self, Self::Error> {
		spec.parse()
	}
}

impl From<IndexSpec> for String {
	fn from(spec: IndexSpec) -> Self {
		spec.to_string()
	}
}

impl fmt::Display for IndexSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Single(field) => write!(f, "{field}"),
			Self::Compound(fields) => write!(f, "{}", fields.join("+")),
			Self::MultiEntry(field) => write!(f, "*{field}"),
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("record rejected by validator: {message}")]
pub struct ValidationError {
	pub message: String,
}

impl ValidationError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

/// Checks, and possibly reshapes, a record's content before it is stored.
pub trait RecordValidator: Send + Sync + 'static {
	fn validate(&self, record: Value) -> Result<Value, ValidationError>;
}

impl<F> RecordValidator for F
where
	F: Fn(Value) -> Result<Value, ValidationError> + Send + Sync + 'static,
{
	fn validate(&self, record: Value) -> Result<Value, ValidationError> {
		self(record)
	}
}

/// How a table is declared in one schema version.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableDefinition {
	/// Tables without a file pattern are never fed from archives.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_pattern: Option<FilePattern>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub index: Vec<IndexSpec>,
	#[serde(skip)]
	pub validator: Option<Arc<dyn RecordValidator>>,
}

impl TableDefinition {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_file_pattern(mut self, pattern: FilePattern) -> Self {
		self.file_pattern = Some(pattern);
		self
	}

	#[must_use]
	pub fn with_index(mut self, spec: IndexSpec) -> Self {
		self.index.push(spec);
		self
	}

	#[must_use]
	pub fn with_validator(mut self, validator: impl RecordValidator) -> Self {
		self.validator = Some(Arc::new(validator));
		self
	}

	#[must_use]
	pub fn is_record_file(&self, path: &str) -> bool {
		self.file_pattern
			.as_ref()
			.is_some_and(|pattern| pattern.matches(path))
	}
}

impl fmt::Debug for TableDefinition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TableDefinition")
			.field("file_pattern", &self.file_pattern)
			.field("index", &self.index)
			.field("has_validator", &self.validator.is_some())
			.finish()
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use super::*;

	#[test]
	fn star_does_not_cross_directories() {
		let pattern = FilePattern::new(["/posts/*.json"]).unwrap();

		assert!(pattern.matches("/posts/a.json"));
		assert!(pattern.matches("posts/a.json"));
		assert!(!pattern.matches("/posts/drafts/a.json"));
		assert!(!pattern.matches("/posts/a.txt"));

		let deep = FilePattern::new(["posts/**/*.json"]).unwrap();
		assert!(deep.matches("/posts/drafts/a.json"));
		assert_eq!(deep.globs(), ["/posts/**/*.json"]);
	}

	#[test]
	fn file_pattern_accepts_one_or_many() {
		let one: FilePattern = serde_json::from_value(serde_json::json!("/a/*.json")).unwrap();
		let many: FilePattern =
			serde_json::from_value(serde_json::json!(["/a/*.json", "/b/*.json"])).unwrap();

		assert!(one.matches("/a/x.json"));
		assert!(many.matches("/b/x.json"));
		assert!(serde_json::from_value::<FilePattern>(serde_json::json!([])).is_err());
		assert!(FilePattern::new(["/a/[.json"]).is_err());
	}

	#[test]
	fn parses_index_specifiers() {
		assert_eq!(
			"title".parse::<IndexSpec>().unwrap(),
			IndexSpec::Single("title".into())
		);
		assert_eq!(
			"author+createdAt".parse::<IndexSpec>().unwrap(),
			IndexSpec::Compound(vec!["author".into(), "createdAt".into()])
		);
		assert_eq!(
			"*tags".parse::<IndexSpec>().unwrap(),
			IndexSpec::MultiEntry("tags".into())
		);
		assert_eq!(
			"author.name".parse::<IndexSpec>().unwrap().to_string(),
			"author.name"
		);

		for bad in ["", "  ", "a++b", "*a+b", "a.", "*", "has space", "+a"] {
			assert!(
				matches!(
					bad.parse::<IndexSpec>(),
					Err(SchemaError::MalformedIndex { .. })
				),
				"{bad:?} should be rejected"
			);
		}
	}

	#[test]
	fn closures_are_validators() {
		let table = TableDefinition::new().with_validator(|record: Value| {
			if record.get("title").is_some() {
				Ok(record)
			} else {
				Err(ValidationError::new("missing title"))
			}
		});

		let validator = table.validator.unwrap();
		assert!(validator.validate(serde_json::json!({"title": "x"})).is_ok());
		assert_eq!(
			validator.validate(serde_json::json!({})).unwrap_err(),
			ValidationError::new("missing title")
		);
	}
}
