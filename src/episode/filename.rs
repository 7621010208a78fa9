use serde::{Deserialize, Serialize};
use url::Url;

/// Maximum length for the stem of a restrictive filename
const MAX_STEM_LENGTH: usize = 200;

/// Filename sanitising levels, from most to least permissive
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FilenameStrategy {
    /// Only strips NUL and path separators
    #[default]
    Permissive,
    /// Additionally strips characters FAT/NTFS reject and control characters
    Ntfs,
    /// Alphanumerics, hyphen and underscore only
    Restrictive,
    /// Publish date plus an opaque token
    Fallback,
}

impl FilenameStrategy {
    pub const ALL: [FilenameStrategy; 4] = [
        FilenameStrategy::Permissive,
        FilenameStrategy::Ntfs,
        FilenameStrategy::Restrictive,
        FilenameStrategy::Fallback,
    ];
}

/// One proposed on-disk name for an episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameCandidate {
    pub strategy: FilenameStrategy,
    pub stem: String,
    pub extension: String,
}

impl FilenameCandidate {
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.stem.clone()
        } else {
            format!("{}.{}", self.stem, self.extension)
        }
    }
}

/// Produce the ranked candidate list for a name base, starting at `start`.
///
/// Candidates with an empty stem or a name already proposed are skipped.
/// The fallback candidate is always present and always last.
pub fn filename_candidates(
    name_base: &str,
    extension: &str,
    fallback_stem: &str,
    start: FilenameStrategy,
) -> Vec<FilenameCandidate> {
    let mut candidates: Vec<FilenameCandidate> = Vec::new();

    for strategy in FilenameStrategy::ALL.into_iter().filter(|s| *s >= start) {
        let (stem, extension) = match strategy {
            FilenameStrategy::Permissive => (filename_permissive(name_base), filename_permissive(extension)),
            FilenameStrategy::Ntfs => (filename_ntfs(name_base), filename_ntfs(extension)),
            FilenameStrategy::Restrictive => (
                truncate_at_boundary(&filename_restrictive(name_base), MAX_STEM_LENGTH),
                filename_restrictive(extension),
            ),
            FilenameStrategy::Fallback => (
                filename_restrictive(fallback_stem),
                filename_restrictive(extension),
            ),
        };

        let candidate = FilenameCandidate {
            strategy,
            stem,
            extension,
        };

        if strategy != FilenameStrategy::Fallback
            && (!is_usable_stem(&candidate.stem)
                || candidates.iter().any(|c| c.file_name() == candidate.file_name()))
        {
            continue;
        }

        candidates.push(candidate);
    }

    candidates
}

fn is_usable_stem(stem: &str) -> bool {
    !stem.trim().is_empty() && stem != "." && stem != ".."
}

/// Filenames allowed on most Linux filesystems: no NUL, no forward slash
fn filename_permissive(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, '\0' | '/')).collect()
}

/// Filenames allowed on NTFS/VFAT filesystems
fn filename_ntfs(name: &str) -> String {
    let options = sanitize_filename::Options {
        windows: true,
        truncate: false,
        replacement: "",
    };
    sanitize_filename::sanitize_with_options(name, options)
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Filenames that should not fall foul of any current protocol
fn filename_restrictive(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    // Find the last separator before max_len
    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind(['-', '_'])
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches(['-', '_']).to_string()
}

/// Last path segment of an enclosure URL, percent-decoded
pub fn original_filename(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Split a filename into stem and extension (without the dot)
pub fn split_filename(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (filename, ""),
    }
}

/// Get the audio file extension for an enclosure
///
/// Attempts to extract from URL path or MIME type, defaults to "mp3"
pub fn audio_extension(url: &Url, mime_type: Option<&str>) -> String {
    let (_, ext) = split_filename(url.path_segments().and_then(|mut s| s.next_back()).unwrap_or(""));
    if is_valid_audio_extension(ext) {
        return ext.to_lowercase();
    }

    // Try to get extension from MIME type
    if let Some(mime) = mime_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    // Default to mp3
    "mp3".to_string()
}

/// Check if a string is a valid audio file extension
fn is_valid_audio_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3" | "m4a" | "m4b" | "mp4" | "aac" | "ogg" | "oga" | "opus" | "wav" | "flac"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        _ => None,
    }
}
