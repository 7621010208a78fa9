use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::episode::FilenameStrategy;
use crate::error::ConfigError;
use crate::filter::FilterConfig;
use crate::tag::TrackNumbering;

/// Name of the application directory below the platform config dir
const APP_NAME: &str = "podjar";

/// Global settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Root directory holding one directory per subscription
    pub base_dir: PathBuf,
    /// Directory holding the history files
    pub db_dir: PathBuf,
    pub concurrency: usize,
    pub episode_concurrency: usize,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub filename_strategy: FilenameStrategy,
    pub id3_remove_v1: bool,
    pub id3_v2_version: u8,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSettings {
    #[serde(default = "default_base_dir")]
    base_dir: PathBuf,
    #[serde(default)]
    db_dir: Option<PathBuf>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_concurrency")]
    episode_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    filename_strategy: FilenameStrategy,
    #[serde(default = "default_id3_remove_v1")]
    id3_remove_v1: bool,
    #[serde(default = "default_id3_v2_version")]
    id3_v2_version: u8,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            db_dir: None,
            concurrency: default_concurrency(),
            episode_concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
            filename_strategy: FilenameStrategy::default(),
            id3_remove_v1: default_id3_remove_v1(),
            id3_v2_version: default_id3_v2_version(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("podcasts"))
        .unwrap_or_else(|| PathBuf::from("podcasts"))
}

fn default_concurrency() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_id3_remove_v1() -> bool {
    true
}

fn default_id3_v2_version() -> u8 {
    4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    #[default]
    Active,
    Inactive,
}

/// Subscription keys that may also appear in `[defaults]`
#[derive(Debug, Clone, Default, Deserialize)]
struct SubscriptionFields {
    #[serde(default)]
    state: Option<SubscriptionState>,
    #[serde(default)]
    max_number: Option<usize>,
    #[serde(default)]
    from_the_top: Option<bool>,
    #[serde(default)]
    rename: Option<String>,
    #[serde(default)]
    track_numbering: Option<TrackNumbering>,
    #[serde(default)]
    filters: Option<FilterConfig>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSubscription {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(flatten)]
    fields: SubscriptionFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    defaults: SubscriptionFields,
    #[serde(default)]
    subscriptions: Vec<RawSubscription>,
}

/// One feed subscription with defaults applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub title: String,
    pub url: String,
    pub max_number: Option<usize>,
    /// Process the feed oldest entry first
    pub from_the_top: bool,
    pub rename: Option<String>,
    pub track_numbering: TrackNumbering,
    pub filters: FilterConfig,
    pub metadata: BTreeMap<String, String>,
}

impl Subscription {
    fn merge(title: String, url: String, own: SubscriptionFields, defaults: &SubscriptionFields) -> Self {
        let filters = match (own.filters, &defaults.filters) {
            (Some(own), Some(defaults)) => own.or(defaults),
            (Some(own), None) => own,
            (None, defaults) => defaults.clone().unwrap_or_default(),
        };
        let mut metadata = defaults.metadata.clone().unwrap_or_default();
        metadata.extend(own.metadata.unwrap_or_default());

        Self {
            title,
            url,
            max_number: own.max_number.or(defaults.max_number),
            from_the_top: own.from_the_top.or(defaults.from_the_top).unwrap_or(false),
            rename: own.rename.or_else(|| defaults.rename.clone()),
            track_numbering: own
                .track_numbering
                .or(defaults.track_numbering)
                .unwrap_or_default(),
            filters,
            metadata,
        }
    }

    /// SHA-256 of the subscription's canonical JSON form
    pub fn fingerprint(&self) -> Result<String, ConfigError> {
        let canonical = serde_json::to_vec(self).map_err(ConfigError::Fingerprint)?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }
}

/// Fully loaded configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub settings: Settings,
    /// Active subscriptions in file order
    pub subscriptions: Vec<Subscription>,
}

impl Config {
    /// `<config_dir>/podjar/podjar.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(format!("{APP_NAME}.toml")))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let settings = Settings {
            base_dir: expand_tilde(&raw.settings.base_dir),
            db_dir: raw
                .settings
                .db_dir
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(|| config_dir.join("db")),
            concurrency: raw.settings.concurrency.max(1),
            episode_concurrency: raw.settings.episode_concurrency.max(1),
            timeout: Duration::from_secs(raw.settings.timeout_secs.max(1)),
            user_agent: raw.settings.user_agent,
            filename_strategy: raw.settings.filename_strategy,
            id3_remove_v1: raw.settings.id3_remove_v1,
            id3_v2_version: raw.settings.id3_v2_version,
        };

        let mut titles: Vec<String> = Vec::new();
        let mut duplicates: Vec<String> = Vec::new();
        let mut subscriptions = Vec::new();

        for (index, sub) in raw.subscriptions.into_iter().enumerate() {
            let (Some(title), Some(url)) = (sub.title, sub.url) else {
                warn!(index, "Ignoring subscription without title or url");
                continue;
            };
            if titles.contains(&title) {
                if !duplicates.contains(&title) {
                    duplicates.push(title.clone());
                }
                continue;
            }
            titles.push(title.clone());

            let state = sub.fields.state.or(raw.defaults.state).unwrap_or_default();
            if state == SubscriptionState::Inactive {
                debug!(subscription = %title, "Skipping inactive subscription");
                continue;
            }
            subscriptions.push(Subscription::merge(title, url, sub.fields, &raw.defaults));
        }

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateTitles(duplicates));
        }

        Ok(Self {
            path: path.to_path_buf(),
            settings,
            subscriptions,
        })
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Persists a subscription's new feed URL after a permanent redirect
pub trait UrlUpdater: Send + Sync {
    fn update_url(&self, title: &str, url: &Url) -> Result<(), ConfigError>;
}

/// Rewrites the `url` key of a subscription in the configuration file
#[derive(Debug, Clone)]
pub struct ConfigFileUpdater {
    path: PathBuf,
}

impl ConfigFileUpdater {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UrlUpdater for ConfigFileUpdater {
    /// Gives up with [`ConfigError::Locked`] instead of waiting for the lock.
    /// Comments in the file are not preserved.
    fn update_url(&self, title: &str, url: &Url) -> Result<(), ConfigError> {
        let path = &self.path;
        let write_failed = |source| ConfigError::WriteFailed {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(write_failed)?;
        FileExt::try_lock_exclusive(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                ConfigError::Locked { path: path.clone() }
            } else {
                write_failed(e)
            }
        })?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| ConfigError::ReadFailed {
                path: path.clone(),
                source: e,
            })?;
        let mut document: toml::Table =
            content.parse().map_err(|e| ConfigError::ParseFailed {
                path: path.clone(),
                source: e,
            })?;

        let entry = document
            .get_mut("subscriptions")
            .and_then(toml::Value::as_array_mut)
            .and_then(|subs| {
                subs.iter_mut()
                    .filter_map(toml::Value::as_table_mut)
                    .find(|sub| sub.get("title").and_then(toml::Value::as_str) == Some(title))
            })
            .ok_or_else(|| ConfigError::SubscriptionNotFound {
                path: path.clone(),
                title: title.to_string(),
            })?;
        entry.insert("url".to_string(), toml::Value::String(url.to_string()));

        let rendered = toml::to_string_pretty(&document)?;
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, rendered).map_err(write_failed)?;
        fs::rename(&temp_path, path).map_err(write_failed)?;

        debug!(subscription = %title, url = %url, "Updated subscription url");
        Ok(())
    }
}
