use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use lofty::config::WriteOptions;
use lofty::file::FileType;
use lofty::prelude::*;
use lofty::tag::{Tag, TagType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TagError;

/// How downloaded files get a track number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackNumbering {
    #[default]
    No,
    /// Always write the next number
    Yes,
    /// Only when the file carries no track number
    IfMissing,
}

/// Everything a tagger needs to know about one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagRequest {
    /// Tag key to value, e.g. `artist = "Host"`
    pub overrides: BTreeMap<String, String>,
    pub track_numbering: TrackNumbering,
    /// Number used if a track number is written
    pub next_track: u32,
    pub remove_id3v1: bool,
    pub use_id3v23: bool,
}

impl TagRequest {
    /// Whether the request asks for any change at all
    pub fn is_needed(&self) -> bool {
        !self.overrides.is_empty() || self.track_numbering != TrackNumbering::No
    }
}

/// What a tagger actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagReport {
    pub track_assigned: Option<u32>,
    /// Override keys the file format has no place for
    pub ignored_keys: Vec<String>,
}

/// Writes metadata into downloaded audio files
///
/// Implementations block; callers run them on the blocking pool.
pub trait Tagger: Send + Sync {
    fn apply_tags(&self, path: &Path, request: &TagRequest) -> Result<TagReport, TagError>;
}

/// Tagger that leaves files untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagger;

impl Tagger for NoopTagger {
    fn apply_tags(&self, _path: &Path, _request: &TagRequest) -> Result<TagReport, TagError> {
        Ok(TagReport::default())
    }
}

/// Tagger backed by lofty
///
/// The format is detected from the file content, so staged downloads can be
/// tagged before they get their final extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagger;

impl Tagger for LoftyTagger {
    fn apply_tags(&self, path: &Path, request: &TagRequest) -> Result<TagReport, TagError> {
        let read_failed = |source| TagError::ReadFailed {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(|e| read_failed(e.into()))?;
        let mut tagged_file = lofty::read_from(&mut file).map_err(read_failed)?;
        drop(file);
        let file_type = tagged_file.file_type();

        if tagged_file.primary_tag().is_none() {
            let tag_type = tagged_file.primary_tag_type();
            tagged_file.insert_tag(Tag::new(tag_type));
        }
        let tag = tagged_file
            .primary_tag_mut()
            .ok_or_else(|| TagError::Unsupported {
                path: path.to_path_buf(),
            })?;

        let mut report = TagReport::default();
        for (key, value) in &request.overrides {
            let inserted = item_key(key).is_some_and(|item| tag.insert_text(item, value.clone()));
            if !inserted {
                report.ignored_keys.push(key.clone());
            }
        }

        let assign_track = match request.track_numbering {
            TrackNumbering::No => false,
            TrackNumbering::Yes => true,
            TrackNumbering::IfMissing => tag.track().is_none(),
        };
        if assign_track {
            tag.set_track(request.next_track);
            report.track_assigned = Some(request.next_track);
        }

        let options = WriteOptions::default().use_id3v23(request.use_id3v23);
        tag.save_to_path(path, options)
            .map_err(|source| TagError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;

        if request.remove_id3v1 && file_type == FileType::Mpeg {
            TagType::Id3v1
                .remove_from_path(path)
                .map_err(|source| TagError::WriteFailed {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        debug!(path = %path.display(), track = ?report.track_assigned, "Tagged file");
        Ok(report)
    }
}

/// Map a configuration key to the format-independent tag item
fn item_key(key: &str) -> Option<ItemKey> {
    let item = match key.to_lowercase().replace('-', "_").as_str() {
        "title" => ItemKey::TrackTitle,
        "artist" => ItemKey::TrackArtist,
        "album" => ItemKey::AlbumTitle,
        "album_artist" | "albumartist" => ItemKey::AlbumArtist,
        "genre" => ItemKey::Genre,
        "date" | "year" => ItemKey::RecordingDate,
        "comment" => ItemKey::Comment,
        "composer" => ItemKey::Composer,
        "publisher" => ItemKey::Publisher,
        "copyright" => ItemKey::CopyrightMessage,
        "description" => ItemKey::Description,
        "language" => ItemKey::Language,
        _ => return None,
    };
    Some(item)
}
