// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Settings, Subscription, UrlUpdater};
use crate::episode::{FilenameStrategy, TransferLimits, clean_partial_files, download_cover, restore_staged};
use crate::error::{FeedError, SubscriptionError, SyncError};
use crate::executor::{Executor, StateUpdate};
use crate::feed::{FetchOutcome, FetchRequest, fetch_feed};
use crate::history::{HistoryRecord, HistoryStore};
use crate::http::{CacheTokens, HttpClient};
use crate::outcome::{NotedEpisode, RunSummary, SubscriptionReport, SubscriptionStatus};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::reconcile::reconcile;
use crate::tag::{TagRequest, Tagger};

/// Name of the file used to check that a directory accepts new files
const WRITE_CHECK: &str = ".podjar-write-check";

/// Options for synchronization
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Root directory holding one directory per subscription
    pub base_dir: PathBuf,
    /// Directory holding the history files
    pub db_dir: PathBuf,
    /// Maximum number of subscriptions processed at once
    pub concurrency: usize,
    /// Maximum number of episode actions at once inside a subscription
    pub episode_concurrency: usize,
    pub timeout: Duration,
    pub filename_strategy: FilenameStrategy,
    pub id3_remove_v1: bool,
    pub id3_v2_version: u8,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_dir: settings.base_dir.clone(),
            db_dir: settings.db_dir.clone(),
            concurrency: settings.concurrency,
            episode_concurrency: settings.episode_concurrency,
            timeout: settings.timeout,
            filename_strategy: settings.filename_strategy,
            id3_remove_v1: settings.id3_remove_v1,
            id3_v2_version: settings.id3_v2_version,
        }
    }
}

/// Collaborators shared by every subscription worker
#[derive(Clone)]
pub struct SyncServices {
    pub tagger: Arc<dyn Tagger>,
    pub url_updater: Arc<dyn UrlUpdater>,
    pub reporter: SharedProgressReporter,
    pub cancel: CancellationToken,
}

/// Synchronize every subscription
///
/// This is the main entry point for the library. Subscriptions run in
/// parallel up to `options.concurrency`, started in configuration order. A
/// failing subscription only affects its own report. The only error is a
/// storage root that cannot be created.
pub async fn sync_all<C: HttpClient + Clone + 'static>(
    client: &C,
    subscriptions: &[Subscription],
    options: &SyncOptions,
    services: &SyncServices,
) -> Result<RunSummary, SyncError> {
    for dir in [&options.base_dir, &options.db_dir] {
        std::fs::create_dir_all(dir).map_err(|e| SyncError::StorageDirectory {
            path: dir.clone(),
            source: e,
        })?;
    }

    // Slot pool limiting how many subscriptions run at once
    let concurrency = options.concurrency.max(1);
    let (slot_tx, mut slot_rx) = mpsc::channel(concurrency);
    for slot in 0..concurrency {
        // Capacity equals the slot count, so this cannot fail
        let _ = slot_tx.try_send(slot);
    }

    let options = Arc::new(options.clone());
    let mut handles = Vec::new();
    let mut summary = RunSummary::default();

    for subscription in subscriptions {
        // Acquire a slot from the pool BEFORE spawning so subscriptions start in order
        let Some(slot) = slot_rx.recv().await else {
            break;
        };
        if services.cancel.is_cancelled() {
            let _ = slot_tx.try_send(slot);
            let mut report = SubscriptionReport::new(&subscription.title);
            report.status = SubscriptionStatus::Cancelled;
            handles.push(Err(report));
            continue;
        }

        let title = subscription.title.clone();
        let slot_tx = slot_tx.clone();
        let client = client.clone();
        let subscription = subscription.clone();
        let options = Arc::clone(&options);
        let services = services.clone();

        let handle = tokio::spawn(async move {
            let report = sync_subscription(&client, &subscription, &options, &services).await;
            // Return slot to the pool when done
            let _ = slot_tx.send(slot).await;
            report
        });
        handles.push(Ok((handle, title)));
    }

    for handle in handles {
        let report = match handle {
            Ok((handle, title)) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    warn!(subscription = %title, error = %e, "Subscription worker panicked");
                    let mut report = SubscriptionReport::new(title);
                    report.status = SubscriptionStatus::Failed {
                        reason: format!("worker failed: {e}"),
                    };
                    report
                }
            },
            Err(report) => report,
        };
        summary.subscriptions.push(report);
    }

    Ok(summary)
}

/// Run one subscription, turning every error into its report
async fn sync_subscription<C: HttpClient>(
    client: &C,
    subscription: &Subscription,
    options: &SyncOptions,
    services: &SyncServices,
) -> SubscriptionReport {
    let title = subscription.title.clone();
    let reporter = &services.reporter;
    let mut report = SubscriptionReport::new(&title);

    reporter.report(ProgressEvent::SubscriptionStarted {
        subscription: title.clone(),
    });

    match run_subscription(client, subscription, options, services, &mut report).await {
        Ok(status) => report.status = status,
        Err(e) => {
            warn!(subscription = %title, error = %e, "Skipping subscription");
            reporter.report(ProgressEvent::SubscriptionFailed {
                subscription: title.clone(),
                error: e.to_string(),
            });
            report.status = SubscriptionStatus::Failed {
                reason: e.to_string(),
            };
        }
    }

    reporter.report(ProgressEvent::SubscriptionCompleted {
        subscription: title,
        downloaded: report.downloaded().count(),
        removed: report.removed().count(),
        failed: report.failed().count(),
    });

    report
}

async fn run_subscription<C: HttpClient>(
    client: &C,
    subscription: &Subscription,
    options: &SyncOptions,
    services: &SyncServices,
    report: &mut SubscriptionReport,
) -> Result<SubscriptionStatus, SubscriptionError> {
    let title = subscription.title.as_str();
    let reporter = &services.reporter;

    let directory = options
        .base_dir
        .join(sanitize_filename::sanitize(title));
    prepare_directory(&directory)?;

    let store = HistoryStore::new(&options.db_dir);
    let mut record = store.load(title)?;

    // Recorded downloads whose final rename never happened
    for episode in record.episodes() {
        match restore_staged(&episode.path).await {
            Ok(false) => {}
            Ok(true) => info!(subscription = %title, episode = %episode.id, "Restored interrupted download"),
            Err(e) => report.warnings.push(format!(
                "Could not restore {}: {e}",
                episode.path.display()
            )),
        }
    }

    match clean_partial_files(&directory).await {
        Ok(0) => {}
        Ok(count) => {
            debug!(subscription = %title, count, "Removed partial downloads");
            reporter.report(ProgressEvent::PartialFilesCleanedUp {
                subscription: title.to_string(),
                count,
            });
        }
        Err(e) => report
            .warnings
            .push(format!("Could not clean partial downloads: {e}")),
    }

    let swept = record.sweep_missing(HistoryStore::verify_episode_file);
    if !swept.is_empty() {
        info!(subscription = %title, count = swept.len(), "Episodes deleted outside podjar");
        // The cached validators describe a feed the history no longer matches
        record.cache = CacheTokens::default();
    }
    let noticed = std::mem::take(&mut record.user_deleted);
    if !noticed.is_empty() {
        store.save(title, &record)?;
    }
    for episode in noticed {
        reporter.report(ProgressEvent::UserDeleted {
            subscription: title.to_string(),
            episode_title: episode.title.clone(),
            path: episode.path.clone(),
        });
        report.user_deleted.push(NotedEpisode {
            id: episode.id,
            title: episode.title,
            path: episode.path,
        });
    }

    let fingerprint = subscription.fingerprint()?;
    let force_refresh = record.fingerprint.as_deref() != Some(fingerprint.as_str()) || !swept.is_empty();
    let url = Url::parse(&subscription.url).map_err(FeedError::from)?;

    if services.cancel.is_cancelled() {
        return Ok(SubscriptionStatus::Cancelled);
    }

    reporter.report(ProgressEvent::FetchingFeed {
        subscription: title.to_string(),
        url: url.to_string(),
    });
    let request = FetchRequest {
        url: &url,
        cache: &record.cache,
        force_refresh,
        oldest_first: subscription.from_the_top,
        timeout: options.timeout,
    };

    let feed = match fetch_feed(client, &request).await {
        FetchOutcome::Fetched(feed) => feed,
        FetchOutcome::Failed(e) => return Err(e.into()),
        FetchOutcome::Unchanged => {
            return Ok(finish_unchanged(title, reporter));
        }
        FetchOutcome::Moved { location, feed } => {
            info!(subscription = %title, url = %location, "Feed moved permanently");
            reporter.report(ProgressEvent::FeedMoved {
                subscription: title.to_string(),
                url: location.to_string(),
            });
            if let Err(e) = services.url_updater.update_url(title, &location) {
                warn!(subscription = %title, error = %e, "Could not record new feed location");
                report
                    .warnings
                    .push(format!("Could not record new feed location: {e}"));
            }
            report.moved_to = Some(location);
            match feed {
                Some(feed) => feed,
                None => return Ok(finish_unchanged(title, reporter)),
            }
        }
    };

    let plan = reconcile(subscription, options.filename_strategy, &directory, &feed, &record)?;
    reporter.report(ProgressEvent::PlanReady {
        subscription: title.to_string(),
        to_acquire: plan.to_acquire.len(),
        to_remove: plan.to_remove.len(),
        unchanged: plan.unchanged.len(),
    });

    let executor = Executor {
        client,
        tagger: Arc::clone(&services.tagger),
        reporter: Arc::clone(reporter),
        cancel: services.cancel.clone(),
        timeout: options.timeout,
        concurrency: options.episode_concurrency,
        subscription: title,
        tags: TagRequest {
            overrides: subscription.metadata.clone(),
            track_numbering: subscription.track_numbering,
            next_track: 0,
            remove_id3v1: options.id3_remove_v1,
            use_id3v23: options.id3_v2_version == 3,
        },
        track_counter: Arc::new(Mutex::new(record.track_number)),
    };

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let writer = write_history(&store, title, record, &plan.priority, updates_rx);
    let (episodes, (mut record, save_errors)) = tokio::join!(
        executor.run(plan.to_remove.clone(), plan.to_acquire.clone(), updates_tx),
        writer
    );
    report.episodes = episodes;
    report.warnings.extend(save_errors.iter().cloned());

    let cancelled = report.episodes.iter().any(|e| e.outcome.is_cancelled());
    let clean = !cancelled && save_errors.is_empty() && report.failed().next().is_none();
    if clean {
        record.cache = plan.cache.clone();
        record.fingerprint = Some(fingerprint);
    }
    record.image_url = plan.image_url.clone();
    let feed_ids = plan.feed_ids.iter().map(String::as_str).collect();
    record.prune_blocked(&feed_ids);
    store.save(title, &record)?;

    if let Some(image_url) = &plan.image_url
        && report.downloaded().next().is_some()
        && !cancelled
    {
        let limits = TransferLimits {
            timeout: options.timeout,
            cancel: &services.cancel,
        };
        match download_cover(client, image_url, &directory, &limits).await {
            Ok(path) => debug!(subscription = %title, path = %path.display(), "Saved cover image"),
            Err(e) => report.warnings.push(format!("Could not save cover image: {e}")),
        }
    }

    if cancelled {
        Ok(SubscriptionStatus::Cancelled)
    } else {
        Ok(SubscriptionStatus::Updated)
    }
}

/// Ensure the subscription directory exists and accepts new files
fn prepare_directory(directory: &Path) -> Result<(), SubscriptionError> {
    std::fs::create_dir_all(directory).map_err(|e| SubscriptionError::CreateDirectoryFailed {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let marker = directory.join(WRITE_CHECK);
    std::fs::write(&marker, b"")
        .and_then(|()| std::fs::remove_file(&marker))
        .map_err(|e| SubscriptionError::DirectoryNotWritable {
            path: directory.to_path_buf(),
            source: e,
        })
}

/// Nothing new upstream
fn finish_unchanged(title: &str, reporter: &SharedProgressReporter) -> SubscriptionStatus {
    reporter.report(ProgressEvent::FeedUnchanged {
        subscription: title.to_string(),
    });
    SubscriptionStatus::Unchanged
}

/// Apply executor updates to the record, persisting after each one
///
/// Returns the final record and any save failures once every sender is gone.
async fn write_history(
    store: &HistoryStore,
    title: &str,
    mut record: HistoryRecord,
    priority: &HashMap<String, usize>,
    mut updates: mpsc::UnboundedReceiver<StateUpdate>,
) -> (HistoryRecord, Vec<String>) {
    let mut errors = Vec::new();

    while let Some(mut update) = updates.recv().await {
        match &mut update {
            StateUpdate::Removed { id } => {
                record.remove(id);
            }
            StateUpdate::Acquired {
                rank,
                episode,
                track,
                ..
            } => {
                let index = record.insertion_index(*rank, priority);
                record.insert_at(index, episode.clone());
                if let Some(track) = *track {
                    record.track_number = record.track_number.max(track);
                }
            }
        }

        if let Err(e) = store.save(title, &record) {
            warn!(subscription = %title, error = %e, "Could not save history");
            errors.push(e.to_string());
        }
        update.acknowledge();
    }

    (record, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use crate::error::ConfigError;
    use crate::filter::FilterConfig;
    use crate::outcome::EpisodeAction;
    use crate::progress::NoopReporter;
    use crate::tag::{NoopTagger, TrackNumbering};
    use crate::testing::{MockHttpClient, MockResponse, rss_feed};

    use tempfile::{TempDir, tempdir};

    const FEED_URL: &str = "https://example.com/feed.xml";

    #[derive(Default)]
    struct RecordingUpdater {
        updates: StdMutex<Vec<(String, String)>>,
        locked: bool,
    }

    impl UrlUpdater for RecordingUpdater {
        fn update_url(&self, title: &str, url: &Url) -> Result<(), ConfigError> {
            if self.locked {
                return Err(ConfigError::Locked {
                    path: PathBuf::from("podjar.toml"),
                });
            }
            self.updates
                .lock()
                .unwrap()
                .push((title.to_string(), url.to_string()));
            Ok(())
        }
    }

    fn subscription(title: &str, url: &str) -> Subscription {
        Subscription {
            title: title.to_string(),
            url: url.to_string(),
            max_number: None,
            from_the_top: false,
            rename: None,
            track_numbering: TrackNumbering::No,
            filters: FilterConfig::default(),
            metadata: BTreeMap::new(),
        }
    }

    fn options(root: &TempDir) -> SyncOptions {
        SyncOptions {
            base_dir: root.path().join("podcasts"),
            db_dir: root.path().join("db"),
            concurrency: 2,
            episode_concurrency: 1,
            timeout: Duration::from_secs(5),
            filename_strategy: FilenameStrategy::Permissive,
            id3_remove_v1: true,
            id3_v2_version: 4,
        }
    }

    fn services(updater: Arc<RecordingUpdater>) -> SyncServices {
        SyncServices {
            tagger: Arc::new(NoopTagger),
            url_updater: updater,
            reporter: NoopReporter::shared(),
            cancel: CancellationToken::new(),
        }
    }

    fn serve_feed(client: &MockHttpClient, url: &str, items: &[(&str, &str)]) {
        let mut response = MockResponse::ok(rss_feed(items));
        response.cache = CacheTokens {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        };
        client.respond(url, response);
        for (guid, _) in items {
            client.respond(&format!("https://example.com/{guid}.mp3"), MockResponse::ok(*guid));
        }
    }

    #[tokio::test]
    async fn first_run_downloads_and_records_history() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A"), ("b", "B")]);
        let options = options(&root);

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options,
            &services(Arc::default()),
        )
        .await
        .unwrap();

        assert_eq!(summary.downloaded_count(), 2);
        assert!(!summary.has_failures());
        assert!(options.base_dir.join("Show").join("a.mp3").exists());

        let record = HistoryStore::new(&options.db_dir).load("Show").unwrap();
        assert_eq!(record.ids(), ["a", "b"]);
        assert_eq!(record.cache.etag.as_deref(), Some("\"v1\""));
        assert!(record.fingerprint.is_some());
    }

    #[tokio::test]
    async fn not_modified_feed_is_unchanged() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A")]);
        let options = options(&root);
        let subs = [subscription("Show", FEED_URL)];
        let services = services(Arc::default());
        sync_all(&client, &subs, &options, &services).await.unwrap();

        client.respond(FEED_URL, MockResponse::status(304));
        let summary = sync_all(&client, &subs, &options, &services).await.unwrap();

        assert_eq!(summary.subscriptions[0].status, SubscriptionStatus::Unchanged);
        let sent = client.requests.lock().unwrap().last().unwrap().1.clone();
        assert_eq!(sent.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn changed_settings_force_a_full_refresh() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A")]);
        let options = options(&root);
        let services = services(Arc::default());
        sync_all(&client, &[subscription("Show", FEED_URL)], &options, &services)
            .await
            .unwrap();

        let mut changed = subscription("Show", FEED_URL);
        changed.max_number = Some(5);
        sync_all(&client, &[changed], &options, &services).await.unwrap();

        let sent = client.requests.lock().unwrap().last().unwrap().1.clone();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn failing_subscription_does_not_affect_others() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A")]);
        client.respond("https://example.com/broken.xml", MockResponse::status(500));
        let subs = [
            subscription("Broken", "https://example.com/broken.xml"),
            subscription("Show", FEED_URL),
        ];

        let summary = sync_all(&client, &subs, &options(&root), &services(Arc::default()))
            .await
            .unwrap();

        assert!(matches!(
            summary.subscriptions[0].status,
            SubscriptionStatus::Failed { .. }
        ));
        assert_eq!(summary.subscriptions[1].status, SubscriptionStatus::Updated);
        assert_eq!(summary.downloaded_count(), 1);
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn moved_feed_updates_config_and_syncs() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut moved = MockResponse::status(301);
        moved.location = Some("https://example.com/new.xml".to_string());
        client.respond(FEED_URL, moved);
        serve_feed(&client, "https://example.com/new.xml", &[("a", "A")]);
        let updater = Arc::new(RecordingUpdater::default());

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options(&root),
            &services(updater.clone()),
        )
        .await
        .unwrap();

        let report = &summary.subscriptions[0];
        assert_eq!(report.moved_to.as_ref().map(Url::as_str), Some("https://example.com/new.xml"));
        assert_eq!(report.downloaded().count(), 1);
        assert_eq!(
            updater.updates.lock().unwrap().as_slice(),
            [("Show".to_string(), "https://example.com/new.xml".to_string())]
        );
    }

    #[tokio::test]
    async fn locked_config_is_only_a_warning() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut moved = MockResponse::status(308);
        moved.location = Some("https://example.com/new.xml".to_string());
        client.respond(FEED_URL, moved);
        serve_feed(&client, "https://example.com/new.xml", &[("a", "A")]);
        let updater = Arc::new(RecordingUpdater {
            locked: true,
            ..Default::default()
        });

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options(&root),
            &services(updater),
        )
        .await
        .unwrap();

        let report = &summary.subscriptions[0];
        assert_eq!(report.status, SubscriptionStatus::Updated);
        assert_eq!(report.warnings.len(), 1);
        assert!(!summary.has_failures());
    }

    #[tokio::test]
    async fn failed_download_keeps_old_tokens() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A"), ("b", "B")]);
        client.respond("https://example.com/b.mp3", MockResponse::status(503));
        let options = options(&root);

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options,
            &services(Arc::default()),
        )
        .await
        .unwrap();

        assert_eq!(summary.failed_count(), 1);
        let record = HistoryStore::new(&options.db_dir).load("Show").unwrap();
        assert_eq!(record.ids(), ["a"]);
        assert!(record.cache.is_empty());
        assert!(record.fingerprint.is_none());
    }

    #[tokio::test]
    async fn cover_is_saved_after_downloads() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        let feed = rss_feed(&[("a", "A")]).replace(
            "<description>Test</description>",
            "<description>Test</description><image><url>https://example.com/cover</url>\
             <title>Test Podcast</title><link>https://example.com</link></image>",
        );
        client.respond(FEED_URL, MockResponse::ok(feed));
        client.respond("https://example.com/a.mp3", MockResponse::ok("a"));
        let mut cover = MockResponse::ok("jpeg bytes");
        cover.content_type = Some("image/jpeg".to_string());
        client.respond("https://example.com/cover", cover);
        let options = options(&root);

        sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options,
            &services(Arc::default()),
        )
        .await
        .unwrap();

        assert!(options.base_dir.join("Show").join("cover.jpg").exists());
    }

    #[tokio::test]
    async fn cancelled_run_skips_subscriptions() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A")]);
        let services = services(Arc::default());
        services.cancel.cancel();

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options(&root),
            &services,
        )
        .await
        .unwrap();

        assert_eq!(summary.subscriptions[0].status, SubscriptionStatus::Cancelled);
        assert!(client.requested().is_empty());
    }

    #[tokio::test]
    async fn unusable_storage_root_aborts_the_run() {
        let root = tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut options = options(&root);
        options.base_dir = blocker.join("podcasts");

        let result = sync_all(
            &MockHttpClient::new(),
            &[subscription("Show", FEED_URL)],
            &options,
            &services(Arc::default()),
        )
        .await;

        assert!(matches!(result, Err(SyncError::StorageDirectory { .. })));
    }

    #[tokio::test]
    async fn writer_inserts_by_rank_and_saves_each_update() {
        let root = tempdir().unwrap();
        let store = HistoryStore::new(root.path());
        let priority: HashMap<String, usize> =
            [("a", 0), ("d", 1), ("b", 2)].map(|(id, r)| (id.to_string(), r)).into();
        let stored = |id: &str| crate::history::StoredEpisode {
            id: id.to_string(),
            title: id.to_string(),
            url: Url::parse(&format!("https://example.com/{id}.mp3")).unwrap(),
            path: root.path().join(format!("{id}.mp3")),
            variables: BTreeMap::new(),
            published: None,
            content_hash: None,
            downloaded_at: chrono::Utc::now(),
        };
        let mut record = HistoryRecord::default();
        record.insert_at(0, stored("a"));
        record.insert_at(1, stored("b"));
        record.insert_at(2, stored("c"));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StateUpdate::Removed { id: "c".to_string() }).unwrap();
        tx.send(StateUpdate::Acquired {
            rank: 1,
            episode: stored("d"),
            track: Some(3),
            recorded: None,
        })
        .unwrap();
        drop(tx);

        let (record, errors) = write_history(&store, "Show", record, &priority, rx).await;

        assert!(errors.is_empty());
        assert_eq!(record.ids(), ["a", "d", "b"]);
        assert_eq!(record.track_number, 3);
        assert_eq!(store.load("Show").unwrap(), record);
    }

    #[tokio::test]
    async fn episodes_are_reported_in_order() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A"), ("b", "B"), ("c", "C")]);
        let mut options = options(&root);
        options.episode_concurrency = 3;

        let summary = sync_all(
            &client,
            &[subscription("Show", FEED_URL)],
            &options,
            &services(Arc::default()),
        )
        .await
        .unwrap();

        let ids: Vec<_> = summary.subscriptions[0]
            .episodes
            .iter()
            .filter(|e| e.action == EpisodeAction::Acquire)
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn deletion_is_reported_once_even_when_the_fetch_fails() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A"), ("b", "B")]);
        let options = options(&root);
        let subs = [subscription("Show", FEED_URL)];
        let services = services(Arc::default());
        sync_all(&client, &subs, &options, &services).await.unwrap();
        std::fs::remove_file(options.base_dir.join("Show").join("a.mp3")).unwrap();

        client.respond(FEED_URL, MockResponse::status(500));
        let summary = sync_all(&client, &subs, &options, &services).await.unwrap();

        let report = &summary.subscriptions[0];
        assert!(matches!(report.status, SubscriptionStatus::Failed { .. }));
        let noticed: Vec<_> = report.user_deleted.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(noticed, ["a"]);

        serve_feed(&client, FEED_URL, &[("a", "A"), ("b", "B")]);
        let summary = sync_all(&client, &subs, &options, &services).await.unwrap();

        assert!(summary.subscriptions[0].user_deleted.is_empty());
        assert_eq!(summary.downloaded_count(), 0);
        let sent = client.requests.lock().unwrap().last().unwrap().1.clone();
        assert!(sent.is_empty());
        assert!(!options.base_dir.join("Show").join("a.mp3").exists());
        let record = HistoryStore::new(&options.db_dir).load("Show").unwrap();
        assert!(record.user_deleted.is_empty());
        assert_eq!(record.ids(), ["b"]);
    }

    #[tokio::test]
    async fn recorded_download_left_staged_is_restored() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        serve_feed(&client, FEED_URL, &[("a", "A")]);
        let options = options(&root);
        let subs = [subscription("Show", FEED_URL)];
        let services = services(Arc::default());
        sync_all(&client, &subs, &options, &services).await.unwrap();

        // History already names the file but the rename never happened
        let dir = options.base_dir.join("Show");
        std::fs::rename(dir.join("a.mp3"), dir.join("a.mp3.partial")).unwrap();

        let summary = sync_all(&client, &subs, &options, &services).await.unwrap();

        assert!(summary.subscriptions[0].user_deleted.is_empty());
        assert_eq!(summary.downloaded_count(), 0);
        assert_eq!(std::fs::read(dir.join("a.mp3")).unwrap(), b"a");
        assert!(!dir.join("a.mp3.partial").exists());
        let fetched = client
            .requested()
            .into_iter()
            .filter(|url| url.ends_with("/a.mp3"))
            .count();
        assert_eq!(fetched, 1);
    }

    #[tokio::test]
    async fn from_the_top_keeps_history_order_across_runs() {
        let root = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut options = options(&root);
        options.episode_concurrency = 3;
        let mut show = subscription("Show", FEED_URL);
        show.from_the_top = true;
        show.max_number = Some(3);
        let subs = [show];
        let services = services(Arc::default());
        let store = HistoryStore::new(&options.db_dir);

        serve_feed(&client, FEED_URL, &[("b", "B"), ("a", "A")]);
        sync_all(&client, &subs, &options, &services).await.unwrap();
        assert_eq!(store.load("Show").unwrap().ids(), ["a", "b"]);

        serve_feed(&client, FEED_URL, &[("d", "D"), ("c", "C"), ("b", "B"), ("a", "A")]);
        let summary = sync_all(&client, &subs, &options, &services).await.unwrap();

        assert_eq!(summary.downloaded_count(), 1);
        assert_eq!(summary.removed_count(), 0);
        assert_eq!(store.load("Show").unwrap().ids(), ["a", "b", "c"]);
        assert!(!options.base_dir.join("Show").join("d.mp3").exists());
    }
}
