use crate::{
	archive::{ArchiveHandle, FileActivity},
	indexer::{IndexOutcome, Indexer},
};

use std::{pin::pin, sync::Arc};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use tokio::{
	spawn,
	task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, instrument, trace, warn, Instrument};

use super::RegistryError;

/// Follows one archive's activity stream and runs a pass for every change it reports.
///
/// Passes queue on the indexer's per-archive lock; nothing is debounced, so N changes may
/// queue up to N passes, most of which find the archive already indexed.
#[derive(Debug)]
pub(super) struct ArchiveWatcher {
	archive_url: String,
	handle: Option<JoinHandle<()>>,
	stop_tx: chan::Sender<()>,
}

impl ArchiveWatcher {
	#[instrument(name = "archive_watcher", skip_all, fields(archive_url = %archive.url()))]
	pub(super) fn new(
		archive: Arc<ArchiveHandle>,
		indexer: Arc<Indexer>,
		patterns: &[String],
		auto_download: bool,
	) -> Result<Self, RegistryError> {
		let activity_rx = archive.watch(patterns)?;
		let (stop_tx, stop_rx) = chan::bounded(1);

		let archive_url = archive.url().to_string();

		let handle = spawn(
			async move {
				Self::handle_activity(archive, indexer, auto_download, activity_rx, stop_rx).await;

				debug!("Archive watcher shutdown");
			}
			.in_current_span(),
		);

		trace!("Now watching archive");

		Ok(Self {
			archive_url,
			handle: Some(handle),
			stop_tx,
		})
	}

	pub(super) fn archive_url(&self) -> &str {
		&self.archive_url
	}

	async fn handle_activity(
		archive: Arc<ArchiveHandle>,
		indexer: Arc<Indexer>,
		auto_download: bool,
		activity_rx: chan::Receiver<FileActivity>,
		stop_rx: chan::Receiver<()>,
	) {
		enum StreamMessage {
			Activity(FileActivity),
			Stop,
		}

		let mut passes = JoinSet::new();

		let mut msg_stream = pin!((
			activity_rx.map(StreamMessage::Activity),
			stop_rx.map(|()| StreamMessage::Stop),
		)
			.merge());

		let mut stopped = false;

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Activity(FileActivity::Invalidated { path }) => {
					if !auto_download {
						trace!(%path, "Ignoring invalidated file, auto download disabled");
						continue;
					}

					let archive = Arc::clone(&archive);
					passes.spawn(
						async move {
							if let Err(e) = archive.download(&path).await {
								error!(?e, %path, "Failed to download invalidated file;");
							}
						}
						.in_current_span(),
					);
				}

				StreamMessage::Activity(FileActivity::Changed { path }) => {
					trace!(%path, "Archive file changed, queueing index pass");

					let archive = Arc::clone(&archive);
					let indexer = Arc::clone(&indexer);
					passes.spawn(
						async move {
							// Failures are already logged by the pass span
							if let Ok(IndexOutcome::Indexed { version, .. }) =
								indexer.index_archive(&archive, false).await
							{
								trace!(version, "Change indexed");
							}
						}
						.in_current_span(),
					);
				}

				StreamMessage::Stop => {
					stopped = true;
					break;
				}
			}

			while let Some(res) = passes.try_join_next() {
				if let Err(e) = res {
					error!(?e, "Archive watcher task failed;");
				}
			}
		}

		if stopped {
			// Queued passes must not run after the archive was unwatched, or they'd put back
			// records an unindex is about to remove
			passes.abort_all();
		} else {
			warn!("Archive activity stream closed");
		}

		while let Some(res) = passes.join_next().await {
			if let Err(e) = res {
				if e.is_panic() {
					error!(?e, "Archive watcher task panicked;");
				}
			}
		}
	}

	/// Stops following the archive and waits until every queued pass is cancelled or done.
	#[instrument(skip(self), fields(archive_url = %self.archive_url))]
	pub(super) async fn stop(mut self) {
		let Some(handle) = self.handle.take() else {
			return;
		};

		if self.stop_tx.send(()).await.is_err() {
			trace!("Archive watcher already finished");
		}

		if let Err(e) = handle.await {
			error!(?e, "Failed to join archive watcher task;");
		}
	}
}

impl Drop for ArchiveWatcher {
	fn drop(&mut self) {
		if self.handle.take().is_some() && self.stop_tx.try_send(()).is_err() {
			trace!(archive_url = %self.archive_url, "Archive watcher already stopping");
		}
	}
}
