use std::path::PathBuf;
use std::sync::Arc;

/// Events emitted during synchronization for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A subscription's run is starting
    SubscriptionStarted { subscription: String },

    /// Feed is being fetched from URL
    FetchingFeed { subscription: String, url: String },

    /// Server reported no changes since the last run
    FeedUnchanged { subscription: String },

    /// Feed reported a permanent new location
    FeedMoved { subscription: String, url: String },

    /// A stored episode's file was deleted outside the program
    UserDeleted {
        subscription: String,
        episode_title: String,
        path: PathBuf,
    },

    /// Reconciliation finished
    PlanReady {
        subscription: String,
        to_acquire: usize,
        to_remove: usize,
        unchanged: usize,
    },

    /// An episode file was deleted
    EpisodeRemoved {
        subscription: String,
        episode_title: String,
        path: PathBuf,
    },

    /// Deleting an episode file failed
    RemovalFailed {
        subscription: String,
        episode_title: String,
        error: String,
    },

    /// A download is starting
    DownloadStarting {
        /// Identifies the download for progress bar management
        download_id: usize,
        episode_title: String,
        /// Index of this episode in the subscription's download queue
        episode_index: usize,
        /// Total number of episodes to download for the subscription
        total_to_download: usize,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Download progress update
    DownloadProgress {
        download_id: usize,
        episode_title: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A download completed successfully
    DownloadCompleted {
        download_id: usize,
        episode_title: String,
        bytes_downloaded: u64,
    },

    /// A download failed or was cancelled
    DownloadFailed {
        download_id: usize,
        episode_title: String,
        error: String,
    },

    /// Download is being finalized (renamed from .partial)
    Finalizing {
        download_id: usize,
        episode_title: String,
    },

    /// Hashing completed for a download
    HashingCompleted {
        download_id: usize,
        episode_title: String,
        hash: String,
    },

    /// Partial files from an interrupted run were removed
    PartialFilesCleanedUp { subscription: String, count: usize },

    /// A subscription's run completed
    SubscriptionCompleted {
        subscription: String,
        downloaded: usize,
        removed: usize,
        failed: usize,
    },

    /// A subscription was skipped for this run
    SubscriptionFailed { subscription: String, error: String },
}

/// Trait for reporting progress events during synchronization.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}
