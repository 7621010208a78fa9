use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use uuid::Uuid;

use crate::feed::{Enclosure, FeedEntry};

use super::filename::{
    FilenameCandidate, FilenameStrategy, audio_extension, filename_candidates, original_filename,
    split_filename,
};
use super::template::RenameTemplate;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Date variable used when an entry carries no publish date
const UNKNOWN_DATE: &str = "1970-01-01";

/// Subscription-wide inputs for expanding feed entries
#[derive(Debug, Clone, Copy)]
pub struct ExpandContext<'a> {
    pub subscription_title: &'a str,
    pub feed_title: &'a str,
    pub feed_author: Option<&'a str>,
    pub directory: &'a Path,
    pub rename: Option<&'a RenameTemplate>,
    pub strategy: FilenameStrategy,
}

/// A feed entry with everything needed to download and name it
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: String,
    pub title: String,
    pub published: Option<DateTime<FixedOffset>>,
    pub enclosure: Enclosure,
    pub author: Option<String>,
    pub directory: PathBuf,
    /// Original filename from the enclosure URL, without extension
    pub basename: String,
    pub extension: String,
    pub size_mb: Option<f64>,
    pub variables: BTreeMap<String, String>,
    /// Ranked from most to least permissive, fallback last
    pub candidates: Vec<FilenameCandidate>,
}

impl Episode {
    pub fn expand(entry: &FeedEntry, enclosure: &Enclosure, ctx: &ExpandContext<'_>) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self::expand_with_token(entry, enclosure, ctx, &token[..9])
    }

    /// Expansion with a caller-provided opaque token, deterministic for a given token
    pub fn expand_with_token(
        entry: &FeedEntry,
        enclosure: &Enclosure,
        ctx: &ExpandContext<'_>,
        token: &str,
    ) -> Self {
        let filename = original_filename(&enclosure.url);
        let (basename, _) = split_filename(&filename);
        let extension = audio_extension(&enclosure.url, enclosure.mime_type.as_deref());
        let date = entry
            .published
            .map(|published| published.with_timezone(&Utc).format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| UNKNOWN_DATE.to_string());

        let variables: BTreeMap<String, String> = [
            ("date", date.clone()),
            ("title_episode", entry.title.clone()),
            ("title_sub", ctx.subscription_title.to_string()),
            ("title_feed", ctx.feed_title.to_string()),
            ("author_feed", ctx.feed_author.unwrap_or_default().to_string()),
            ("author_entry", entry.author.clone().unwrap_or_default()),
            ("guid", entry.id.clone()),
            ("uuid", token.to_string()),
            ("basename", basename.to_string()),
            ("extension", extension.clone()),
            ("filename", filename.clone()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let name_base = match ctx.rename {
            Some(template) => template.render(&variables),
            None => basename.to_string(),
        };
        let fallback_stem = format!("{date}-{token}");
        let candidates = filename_candidates(&name_base, &extension, &fallback_stem, ctx.strategy);

        let size_mb = enclosure
            .length
            .map(|length| (length as f64 / BYTES_PER_MB * 100.0).round() / 100.0);

        Self {
            id: entry.id.clone(),
            title: entry.title.clone(),
            published: entry.published,
            enclosure: enclosure.clone(),
            author: entry.author.clone(),
            directory: ctx.directory.to_path_buf(),
            basename: basename.to_string(),
            extension,
            size_mb,
            variables,
            candidates,
        }
    }

    /// File name the episode would get under its first candidate
    pub fn first_file_name(&self) -> String {
        self.candidates
            .first()
            .map(FilenameCandidate::file_name)
            .unwrap_or_default()
    }

    /// Candidates to try at download time.
    ///
    /// Non-unique episodes skip straight to the fallback.
    pub fn attempt_order(&self, non_unique: bool) -> &[FilenameCandidate] {
        if non_unique && !self.candidates.is_empty() {
            &self.candidates[self.candidates.len() - 1..]
        } else {
            &self.candidates
        }
    }
}
