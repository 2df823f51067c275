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

use adb_schema::SchemaError;

use thiserror::Error;

pub mod archive;
pub mod config;
pub mod events;
pub mod indexer;
pub mod memory;
pub mod rebuild;
pub mod registry;
pub mod store;
pub mod table;

mod database;

pub use archive::{Archive, ArchiveError, ArchiveHandle, ArchiveInfo, ArchiveOpener, FileActivity};
pub use config::{ConfigError, IndexerConfig};
pub use database::Database;
pub use events::{EventBus, IndexEvent};
pub use indexer::{IndexOutcome, Indexer, IndexerError};
pub use registry::{ArchiveRegistry, RegistryError};
pub use store::{IndexMeta, Record, StoreError, TableStore};
pub use table::{RecordFile, Table, Tables};

pub use adb_schema as schema;

#[derive(Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Schema(#[from] SchemaError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("table store is at schema version {stored}, newer than the latest declared {latest}")]
	SchemaDowngrade { stored: u32, latest: u32 },
}
