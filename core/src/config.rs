//! Indexer configuration, persisted as JSON in the data directory.

use crate::events::DEFAULT_EVENT_CAPACITY;

use std::{
	io,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const CONFIG_FILE_NAME: &str = "archive-indexer.json";

const CURRENT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to {action} config file <path='{}'>: {source}", path.display())]
	Io {
		action: &'static str,
		path: PathBuf,
		source: io::Error,
	},
	#[error("config file is not valid: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("config version {0} is newer than this build supports")]
	UnsupportedVersion(u32),
	#[error("invalid log level '{level}': {reason}")]
	InvalidLogLevel { level: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexerConfig {
	pub version: u32,
	/// An `EnvFilter` directive, e.g. `info` or `adb_core=debug`.
	pub log_level: String,
	/// How many index events a slow subscriber may fall behind before it lags.
	pub event_capacity: usize,
	/// Download files the archive reports as invalidated.
	pub auto_download: bool,
	#[serde(skip)]
	data_dir: Option<PathBuf>,
}

impl Default for IndexerConfig {
	fn default() -> Self {
		Self {
			version: CURRENT_VERSION,
			log_level: "info".to_string(),
			event_capacity: DEFAULT_EVENT_CAPACITY,
			auto_download: true,
			data_dir: None,
		}
	}
}

impl IndexerConfig {
	/// Loads the config from `data_dir`, writing the defaults there first if there is none.
	pub async fn load_from(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let data_dir = data_dir.as_ref();
		let path = data_dir.join(CONFIG_FILE_NAME);

		let mut config = match fs::read(&path).await {
			Ok(bytes) => {
				info!(path = %path.display(), "Loading indexer config");
				serde_json::from_slice::<Self>(&bytes)?
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "No indexer config found, creating default");
				let config = Self {
					data_dir: Some(data_dir.to_path_buf()),
					..Self::default()
				};
				config.save().await?;
				return Ok(config);
			}
			Err(source) => {
				return Err(ConfigError::Io {
					action: "read",
					path,
					source,
				})
			}
		};

		config.data_dir = Some(data_dir.to_path_buf());

		match config.version {
			v if v > CURRENT_VERSION => return Err(ConfigError::UnsupportedVersion(v)),
			v if v < CURRENT_VERSION => {
				info!(from = v, to = CURRENT_VERSION, "Migrating indexer config");
				config.version = CURRENT_VERSION;
				config.save().await?;
			}
			_ => {}
		}

		Ok(config)
	}

	/// Writes the config back to the directory it was loaded from; a config built in code has
	/// nowhere to go and is left unsaved.
	pub async fn save(&self) -> Result<(), ConfigError> {
		let Some(data_dir) = &self.data_dir else {
			warn!("Indexer config has no data directory, not saving");
			return Ok(());
		};

		fs::create_dir_all(data_dir)
			.await
			.map_err(|source| ConfigError::Io {
				action: "create directory for",
				path: data_dir.clone(),
				source,
			})?;

		let path = data_dir.join(CONFIG_FILE_NAME);
		fs::write(&path, serde_json::to_vec_pretty(self)?)
			.await
			.map_err(|source| ConfigError::Io {
				action: "write",
				path,
				source,
			})
	}

	#[must_use]
	pub fn data_dir(&self) -> Option<&Path> {
		self.data_dir.as_deref()
	}

	/// Installs a global `tracing` subscriber filtered by `RUST_LOG`, falling back to the
	/// configured level. Does nothing if a subscriber is already installed.
	pub fn init_logger(&self) -> Result<(), ConfigError> {
		let filter = match EnvFilter::try_from_default_env() {
			Ok(filter) => filter,
			Err(_) => EnvFilter::try_new(&self.log_level).map_err(|e| {
				ConfigError::InvalidLogLevel {
					level: self.log_level.clone(),
					reason: e.to_string(),
				}
			})?,
		};

		if tracing_subscriber::registry()
			.with(fmt::layer())
			.with(filter)
			.try_init()
			.is_err()
		{
			warn!("Global tracing subscriber already set");
		}

		Ok(())
	}
}
