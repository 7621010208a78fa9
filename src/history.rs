// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::HistoryError;
use crate::http::CacheTokens;

/// An episode whose file was written by a previous run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEpisode {
    pub id: String,
    pub title: String,
    pub url: Url,
    pub path: PathBuf,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub published: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub downloaded_at: DateTime<Utc>,
}

/// On-disk shape of a history record
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(default)]
    cache: CacheTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_url: Option<Url>,
    #[serde(default)]
    track_number: u32,
    #[serde(default)]
    episodes: Vec<StoredEpisode>,
    #[serde(default)]
    user_deleted: Vec<StoredEpisode>,
    #[serde(default)]
    blocked: BTreeSet<String>,
}

/// Persisted state of one subscription
///
/// Episodes are kept in insertion order; the order and the lookup map
/// always hold the same identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryRecord {
    /// Digest of the subscription settings used for the last complete run
    pub fingerprint: Option<String>,
    pub cache: CacheTokens,
    pub image_url: Option<Url>,
    /// Last track number handed out
    pub track_number: u32,
    /// Episodes found missing on disk, reported once then cleared
    pub user_deleted: Vec<StoredEpisode>,
    /// Identifiers never downloaded again while the feed carries them
    pub blocked: BTreeSet<String>,
    order: Vec<String>,
    episodes: HashMap<String, StoredEpisode>,
}

impl HistoryRecord {
    fn from_file(file: HistoryFile) -> Result<Self, String> {
        let mut record = HistoryRecord {
            fingerprint: file.fingerprint,
            cache: file.cache,
            image_url: file.image_url,
            track_number: file.track_number,
            user_deleted: file.user_deleted,
            blocked: file.blocked,
            ..Default::default()
        };

        for episode in file.episodes {
            if record.episodes.contains_key(&episode.id) {
                return Err(episode.id);
            }
            record.order.push(episode.id.clone());
            record.episodes.insert(episode.id.clone(), episode);
        }

        Ok(record)
    }

    fn to_file(&self) -> HistoryFile {
        HistoryFile {
            fingerprint: self.fingerprint.clone(),
            cache: self.cache.clone(),
            image_url: self.image_url.clone(),
            track_number: self.track_number,
            episodes: self.episodes().cloned().collect(),
            user_deleted: self.user_deleted.clone(),
            blocked: self.blocked.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.episodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&StoredEpisode> {
        self.episodes.get(id)
    }

    /// Identifiers in insertion order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Episodes in insertion order
    pub fn episodes(&self) -> impl Iterator<Item = &StoredEpisode> {
        self.order.iter().filter_map(|id| self.episodes.get(id))
    }

    /// Insert at `index` (clamped); an existing entry with the same id is replaced in place
    pub fn insert_at(&mut self, index: usize, episode: StoredEpisode) {
        if self.episodes.contains_key(&episode.id) {
            self.episodes.insert(episode.id.clone(), episode);
            return;
        }
        let index = index.min(self.order.len());
        self.order.insert(index, episode.id.clone());
        self.episodes.insert(episode.id.clone(), episode);
    }

    pub fn remove(&mut self, id: &str) -> Option<StoredEpisode> {
        let episode = self.episodes.remove(id)?;
        self.order.retain(|known| known != id);
        Some(episode)
    }

    /// Position for a newly acquired episode of priority `rank`
    ///
    /// That is directly after the last stored episode ranked before it.
    /// Stored ids missing from `priority` are ignored.
    pub fn insertion_index(&self, rank: usize, priority: &HashMap<String, usize>) -> usize {
        self.order
            .iter()
            .rposition(|id| priority.get(id).is_some_and(|&r| r < rank))
            .map_or(0, |pos| pos + 1)
    }

    /// Move episodes whose file no longer exists into the user-deleted list
    /// and the blocked set. Returns the swept episodes in stored order.
    pub fn sweep_missing(&mut self, exists: impl Fn(&StoredEpisode) -> bool) -> Vec<StoredEpisode> {
        let missing: Vec<String> = self
            .episodes()
            .filter(|episode| !exists(episode))
            .map(|episode| episode.id.clone())
            .collect();

        let swept: Vec<StoredEpisode> = missing.iter().filter_map(|id| self.remove(id)).collect();
        for episode in &swept {
            self.blocked.insert(episode.id.clone());
            self.user_deleted.push(episode.clone());
        }
        swept
    }

    /// Forget blocked ids the feed no longer carries
    pub fn prune_blocked(&mut self, feed_ids: &HashSet<&str>) {
        self.blocked.retain(|id| feed_ids.contains(id.as_str()));
    }
}

/// Directory of per-subscription history files
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of a subscription's history file
    pub fn path_for(&self, title: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_filename::sanitize(title)))
    }

    /// Load a subscription's record, or an empty one if none exists yet
    pub fn load(&self, title: &str) -> Result<HistoryRecord, HistoryError> {
        let path = self.path_for(title);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No history yet");
                return Ok(HistoryRecord::default());
            }
            Err(e) => return Err(HistoryError::ReadFailed { path, source: e }),
        };

        let file: HistoryFile =
            serde_json::from_str(&content).map_err(|e| HistoryError::ParseFailed {
                path: path.clone(),
                source: e,
            })?;

        HistoryRecord::from_file(file).map_err(|id| HistoryError::DuplicateEpisode { path, id })
    }

    /// Persist a record atomically: temp file, fsync, rename
    pub fn save(&self, title: &str, record: &HistoryRecord) -> Result<(), HistoryError> {
        let path = self.path_for(title);
        let temp_path = path.with_extension("json.tmp");
        let write_failed = |source| HistoryError::WriteFailed {
            path: path.clone(),
            source,
        };

        let file = File::create(&temp_path).map_err(write_failed)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &record.to_file())?;
        writer.flush().map_err(write_failed)?;
        let file = writer
            .into_inner()
            .map_err(|e| write_failed(e.into_error()))?;
        file.sync_all().map_err(write_failed)?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(write_failed)?;

        debug!(path = %path.display(), episodes = record.len(), "Saved history");
        Ok(())
    }

    /// Whether the episode's recorded file is still on disk
    pub fn verify_episode_file(episode: &StoredEpisode) -> bool {
        episode.path.is_file()
    }
}
