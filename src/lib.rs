pub mod config;
pub mod episode;
pub mod error;
pub mod executor;
pub mod feed;
pub mod filter;
pub mod history;
pub mod http;
pub mod outcome;
pub mod progress;
pub mod reconcile;
pub mod sync;
pub mod tag;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{Config, ConfigFileUpdater, Settings, Subscription, UrlUpdater};
pub use episode::{Episode, FilenameCandidate, FilenameStrategy};
pub use error::{
    ConfigError, DownloadError, FeedError, FilterError, HistoryError, SubscriptionError,
    SyncError, TagError, TemplateError,
};
pub use feed::{FeedEntry, FeedSnapshot, FetchOutcome, FetchedFeed, fetch_feed, parse_feed};
pub use history::{HistoryRecord, HistoryStore, StoredEpisode};
pub use http::{CacheTokens, HttpClient, HttpOptions, HttpResponse, ReqwestClient};
pub use outcome::{
    ActionOutcome, EpisodeAction, EpisodeReport, RunSummary, SubscriptionReport,
    SubscriptionStatus,
};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use reconcile::{Acquisition, SyncPlan, reconcile};
pub use sync::{SyncOptions, SyncServices, sync_all};
pub use tag::{LoftyTagger, NoopTagger, TagRequest, Tagger, TrackNumbering};
