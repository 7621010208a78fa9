// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::episode::{DownloadContext, DownloadedFile, Episode, TransferLimits, download_episode};
use crate::error::TagError;
use crate::history::StoredEpisode;
use crate::http::HttpClient;
use crate::outcome::{ActionOutcome, EpisodeAction, EpisodeReport};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::reconcile::Acquisition;
use crate::tag::{TagReport, TagRequest, Tagger};

/// Run-wide download counter used to key progress bars
static NEXT_DOWNLOAD_ID: AtomicUsize = AtomicUsize::new(0);

/// A change to apply to the subscription's history
#[derive(Debug)]
pub enum StateUpdate {
    Removed {
        id: String,
    },
    Acquired {
        rank: usize,
        episode: StoredEpisode,
        /// Track number written into the file, if any
        track: Option<u32>,
        /// Signalled once the entry is saved; the file is renamed into place after that
        recorded: Option<oneshot::Sender<()>>,
    },
}

impl StateUpdate {
    /// Release the sender waiting for this update to be persisted
    pub fn acknowledge(&mut self) {
        if let StateUpdate::Acquired { recorded, .. } = self {
            if let Some(recorded) = recorded.take() {
                let _ = recorded.send(());
            }
        }
    }
}

/// Everything the executor needs for one subscription
pub struct Executor<'a, C: HttpClient> {
    pub client: &'a C,
    pub tagger: Arc<dyn Tagger>,
    pub reporter: SharedProgressReporter,
    pub cancel: CancellationToken,
    pub timeout: Duration,
    /// Parallel actions inside the subscription
    pub concurrency: usize,
    pub subscription: &'a str,
    /// Tagging applied to every download; `next_track` is filled in per file
    pub tags: TagRequest,
    /// Last track number handed out
    pub track_counter: Arc<Mutex<u32>>,
}

impl<C: HttpClient> Executor<'_, C> {
    /// Perform removals, then acquisitions.
    ///
    /// Every terminal action is reported; successful ones are also sent to
    /// `updates`. The sender is dropped on return, ending the writer.
    pub async fn run(
        &self,
        to_remove: Vec<StoredEpisode>,
        to_acquire: Vec<Acquisition>,
        updates: mpsc::UnboundedSender<StateUpdate>,
    ) -> Vec<EpisodeReport> {
        let concurrency = self.concurrency.max(1);

        let mut removals: Vec<(usize, EpisodeReport)> = futures::stream::iter(to_remove.into_iter().enumerate())
            .map(|(index, stored)| {
                let updates = updates.clone();
                async move { (index, self.remove(stored, &updates).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        removals.sort_by_key(|(index, _)| *index);

        let total_to_download = to_acquire.len();
        let mut acquisitions: Vec<(usize, EpisodeReport)> = futures::stream::iter(to_acquire.into_iter().enumerate())
            .map(|(episode_index, acquisition)| {
                let updates = updates.clone();
                async move {
                    let rank = acquisition.rank;
                    let context = DownloadContext {
                        download_id: NEXT_DOWNLOAD_ID.fetch_add(1, Ordering::Relaxed),
                        episode_index,
                        total_to_download,
                    };
                    (rank, self.acquire(acquisition, &context, &updates).await)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        acquisitions.sort_by_key(|(rank, _)| *rank);

        removals
            .into_iter()
            .chain(acquisitions)
            .map(|(_, report)| report)
            .collect()
    }

    async fn remove(&self, stored: StoredEpisode, updates: &mpsc::UnboundedSender<StateUpdate>) -> EpisodeReport {
        let outcome = if self.cancel.is_cancelled() {
            ActionOutcome::Cancelled
        } else {
            match tokio::fs::remove_file(&stored.path).await {
                Ok(()) => ActionOutcome::Success(stored.path.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %stored.path.display(), "File already gone");
                    ActionOutcome::Success(stored.path.clone())
                }
                Err(e) => ActionOutcome::failed(format!(
                    "Failed to delete {}: {e}",
                    stored.path.display()
                )),
            }
        };

        match &outcome {
            ActionOutcome::Success(path) => {
                info!(subscription = %self.subscription, episode = %stored.id, "Removed episode");
                self.reporter.report(ProgressEvent::EpisodeRemoved {
                    subscription: self.subscription.to_string(),
                    episode_title: stored.title.clone(),
                    path: path.clone(),
                });
                send(updates, StateUpdate::Removed {
                    id: stored.id.clone(),
                });
            }
            ActionOutcome::Failed { reason } => {
                warn!(subscription = %self.subscription, episode = %stored.id, %reason, "Removal failed");
                self.reporter.report(ProgressEvent::RemovalFailed {
                    subscription: self.subscription.to_string(),
                    episode_title: stored.title.clone(),
                    error: reason.clone(),
                });
            }
            ActionOutcome::Cancelled => {}
        }

        EpisodeReport {
            id: stored.id,
            title: stored.title,
            action: EpisodeAction::Remove,
            outcome,
            tag_warning: None,
        }
    }

    async fn acquire(
        &self,
        acquisition: Acquisition,
        context: &DownloadContext,
        updates: &mpsc::UnboundedSender<StateUpdate>,
    ) -> EpisodeReport {
        let Acquisition {
            rank,
            episode,
            non_unique,
        } = acquisition;

        let limits = TransferLimits {
            timeout: self.timeout,
            cancel: &self.cancel,
        };
        let result = if self.cancel.is_cancelled() {
            Err(crate::error::DownloadError::Cancelled)
        } else {
            download_episode(
                self.client,
                &episode,
                episode.attempt_order(non_unique),
                &limits,
                context,
                &self.reporter,
            )
            .await
        };

        let mut tag_warning = None;
        let outcome: ActionOutcome<DownloadedFile> = result.into();
        let outcome = match outcome {
            ActionOutcome::Success(file) => {
                self.keep(rank, &episode, file, context, updates, &mut tag_warning)
                    .await
            }
            ActionOutcome::Failed { reason } => {
                warn!(subscription = %self.subscription, episode = %episode.id, %reason, "Download failed");
                self.reporter.report(ProgressEvent::DownloadFailed {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    error: reason.clone(),
                });
                ActionOutcome::Failed { reason }
            }
            ActionOutcome::Cancelled => {
                self.reporter.report(ProgressEvent::DownloadFailed {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    error: "cancelled".to_string(),
                });
                ActionOutcome::Cancelled
            }
        };

        EpisodeReport {
            id: episode.id,
            title: episode.title,
            action: EpisodeAction::Acquire,
            outcome,
            tag_warning,
        }
    }

    /// Tag a staged download, record it, then move it to its final name.
    ///
    /// The rename waits until the history writer has saved the entry, so an
    /// interrupted run leaves either nothing or a recorded `.partial` file
    /// that the next run restores.
    async fn keep(
        &self,
        rank: usize,
        episode: &Episode,
        file: DownloadedFile,
        context: &DownloadContext,
        updates: &mpsc::UnboundedSender<StateUpdate>,
        tag_warning: &mut Option<String>,
    ) -> ActionOutcome<PathBuf> {
        info!(
            subscription = %self.subscription,
            episode = %episode.id,
            path = %file.path.display(),
            bytes = file.bytes,
            "Downloaded episode"
        );

        let mut track = None;
        match self.tag(file.staged_path.clone()).await {
            Ok(Some(report)) => {
                track = report.track_assigned;
                if !report.ignored_keys.is_empty() {
                    debug!(keys = ?report.ignored_keys, "Tag keys not supported by format");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(subscription = %self.subscription, episode = %episode.id, error = %e, "Tagging failed");
                *tag_warning = Some(e.to_string());
            }
        }

        let (recorded, saved) = oneshot::channel();
        send(updates, StateUpdate::Acquired {
            rank,
            episode: StoredEpisode {
                id: episode.id.clone(),
                title: episode.title.clone(),
                url: episode.enclosure.url.clone(),
                path: file.path.clone(),
                variables: episode.variables.clone(),
                published: episode.published,
                content_hash: Some(file.content_hash.clone()),
                downloaded_at: Utc::now(),
            },
            track,
            recorded: Some(recorded),
        });
        if saved.await.is_err() {
            warn!(episode = %episode.id, "History writer dropped the update unacknowledged");
        }

        self.reporter.report(ProgressEvent::Finalizing {
            download_id: context.download_id,
            episode_title: episode.title.clone(),
        });
        match file.commit().await {
            Ok(()) => {
                self.reporter.report(ProgressEvent::DownloadCompleted {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    bytes_downloaded: file.bytes,
                });
                ActionOutcome::Success(file.path)
            }
            Err(e) => {
                warn!(subscription = %self.subscription, episode = %episode.id, error = %e, "Commit failed");
                send(updates, StateUpdate::Removed {
                    id: episode.id.clone(),
                });
                self.reporter.report(ProgressEvent::DownloadFailed {
                    download_id: context.download_id,
                    episode_title: episode.title.clone(),
                    error: e.to_string(),
                });
                ActionOutcome::failed(e)
            }
        }
    }

    /// Tag a downloaded file on the blocking pool.
    ///
    /// The counter lock is held until the tagger returns so numbers are
    /// handed out in completion order without gaps.
    async fn tag(&self, path: PathBuf) -> Result<Option<TagReport>, TagError> {
        if !self.tags.is_needed() {
            return Ok(None);
        }

        let mut counter = self.track_counter.lock().await;
        let request = TagRequest {
            next_track: *counter + 1,
            ..self.tags.clone()
        };
        let tagger = Arc::clone(&self.tagger);

        let report = tokio::task::spawn_blocking(move || tagger.apply_tags(&path, &request))
            .await
            .map_err(|e| TagError::Task(e.to_string()))??;

        if let Some(track) = report.track_assigned {
            *counter = (*counter).max(track);
        }
        Ok(Some(report))
    }
}

fn send(updates: &mpsc::UnboundedSender<StateUpdate>, update: StateUpdate) {
    if updates.send(update).is_err() {
        warn!("History writer stopped before all updates were delivered");
    }
}
