use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Fetching feed from {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Redirect from {url} carries no usable location")]
    BadRedirect { url: String },

    #[error("Too many redirects while fetching {url}")]
    TooManyRedirects { url: String },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Download of {url} stalled for more than {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("No candidate filename for '{title}' could be created")]
    NoUsableFilename { title: String },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} into place: {source}")]
    RenameFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unknown image type '{mime}' for {url}")]
    UnknownImageType { url: String, mime: String },

    #[error("Download cancelled")]
    Cancelled,
}

/// Errors raised by the per-subscription history store
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to read history file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse history file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("History file {path} lists episode '{id}' more than once")]
    DuplicateEpisode { path: PathBuf, id: String },

    #[error("Failed to write history file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize history: {0}")]
    SerializeFailed(#[from] serde_json::Error),
}

/// A configured filter value that cannot be used
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Bad {filter} filter: {source}")]
    Regex {
        filter: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("Bad hour filter '{value}': expected a number between 0 and 23")]
    Hour { value: String },

    #[error("Bad weekdays filter '{value}': expected digits 0 (Monday) to 6 (Sunday)")]
    Weekdays { value: String },

    #[error("Bad after_date filter '{value}': {source}")]
    Date {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Rename template problems
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Rename template uses unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("Rename template '{template}' has an unclosed placeholder")]
    Unclosed { template: String },
}

/// Errors while loading or updating the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Duplicate subscription titles: {}", .0.join(", "))]
    DuplicateTitles(Vec<String>),

    #[error("Config file {path} is locked by another process")]
    Locked { path: PathBuf },

    #[error("No subscription titled '{title}' in {path}")]
    SubscriptionNotFound { path: PathBuf, title: String },

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("Failed to fingerprint subscription settings: {0}")]
    Fingerprint(#[source] serde_json::Error),

    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the audio tagging collaborator
#[derive(Error, Debug)]
pub enum TagError {
    #[error("Failed to read {path} for tagging: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: lofty::error::LoftyError,
    },

    #[error("{path} has no taggable format")]
    Unsupported { path: PathBuf },

    #[error("Failed to write tags to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: lofty::error::LoftyError,
    },

    #[error("Tagging task failed: {0}")]
    Task(String),
}

/// Errors that skip one subscription for the current run
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Could not create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not save files to {path}: {source}")]
    DirectoryNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Top-level errors that abort the whole run
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Could not prepare storage directory {path}: {source}")]
    StorageDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
