use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::http::{ByteStream, HttpClient, HttpResponse};
use crate::progress::{ProgressEvent, SharedProgressReporter};

use super::expand::Episode;
use super::filename::{FilenameCandidate, FilenameStrategy};

/// Suffix of files that are still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Context for tracking a download in concurrent scenarios
#[derive(Debug, Clone)]
pub struct DownloadContext {
    /// Run-wide identifier for progress bar management
    pub download_id: usize,
    /// Index of this episode in the download queue
    pub episode_index: usize,
    /// Total number of episodes to download
    pub total_to_download: usize,
}

/// Limits applied to a single transfer
#[derive(Debug, Clone)]
pub struct TransferLimits<'a> {
    /// Ceiling for the request and for every idle gap between chunks
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// A fully streamed download still waiting under its `.partial` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Name the file gets once committed
    pub path: PathBuf,
    /// Where the data currently is
    pub staged_path: PathBuf,
    pub bytes: u64,
    /// `sha256:<hex>` of the file contents
    pub content_hash: String,
    pub strategy: FilenameStrategy,
}

impl DownloadedFile {
    /// Move the data to its final name, discarding it if that fails
    pub async fn commit(&self) -> Result<(), DownloadError> {
        commit_partial(&self.staged_path, &self.path).await
    }
}

/// Stream an episode into `<name>.partial` for the first candidate that can be created
///
/// Candidates whose final or partial file already exists are skipped. The
/// data stays staged until [`DownloadedFile::commit`], so the caller can
/// record it first. On any failure the partial file is removed before
/// returning.
pub async fn download_episode<C: HttpClient>(
    client: &C,
    episode: &Episode,
    candidates: &[FilenameCandidate],
    limits: &TransferLimits<'_>,
    context: &DownloadContext,
    reporter: &SharedProgressReporter,
) -> Result<DownloadedFile, DownloadError> {
    let url = episode.enclosure.url.as_str();

    let response = open_stream(client, url, limits).await?;

    let (file, candidate, final_path, partial_path) =
        create_partial(&episode.directory, candidates, &episode.title).await?;

    reporter.report(ProgressEvent::DownloadStarting {
        download_id: context.download_id,
        episode_title: episode.title.clone(),
        episode_index: context.episode_index,
        total_to_download: context.total_to_download,
        content_length: response.content_length,
    });

    let total_bytes = response.content_length;
    let streamed = stream_to_file(file, response.body, url, &partial_path, limits, |bytes| {
        reporter.report(ProgressEvent::DownloadProgress {
            download_id: context.download_id,
            episode_title: episode.title.clone(),
            bytes_downloaded: bytes,
            total_bytes,
        });
    })
    .await;

    let (bytes, content_hash) = match streamed {
        Ok(result) => result,
        Err(e) => {
            discard_partial(&partial_path).await;
            return Err(e);
        }
    };

    reporter.report(ProgressEvent::HashingCompleted {
        download_id: context.download_id,
        episode_title: episode.title.clone(),
        hash: content_hash.clone(),
    });

    Ok(DownloadedFile {
        path: final_path,
        staged_path: partial_path,
        bytes,
        content_hash,
        strategy: candidate.strategy,
    })
}

/// Download a feed's cover image into `cover.<ext>` inside `directory`
///
/// The extension is derived from the response MIME type.
pub async fn download_cover<C: HttpClient>(
    client: &C,
    url: &Url,
    directory: &Path,
    limits: &TransferLimits<'_>,
) -> Result<PathBuf, DownloadError> {
    let response = open_stream(client, url.as_str(), limits).await?;

    let mime = response
        .content_type
        .as_deref()
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_lowercase())
        .unwrap_or_default();
    let extension = image_extension(&mime).ok_or_else(|| DownloadError::UnknownImageType {
        url: url.to_string(),
        mime: mime.clone(),
    })?;

    let final_path = directory.join(format!("cover.{extension}"));
    let partial_path = partial_path_for(&final_path);
    let file = File::create(&partial_path)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: partial_path.clone(),
            source: e,
        })?;

    if let Err(e) = stream_to_file(file, response.body, url.as_str(), &partial_path, limits, |_| {}).await {
        discard_partial(&partial_path).await;
        return Err(e);
    }
    commit_partial(&partial_path, &final_path).await?;

    Ok(final_path)
}

/// Map an image MIME type to the extension used for the cover file
fn image_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "image/bmp" => Some("bmp"),
        "image/gif" => Some("gif"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn open_stream<C: HttpClient>(
    client: &C,
    url: &str,
    limits: &TransferLimits<'_>,
) -> Result<HttpResponse, DownloadError> {
    let request = tokio::time::timeout(limits.timeout, client.get_stream(url));
    let response = tokio::select! {
        biased;
        _ = limits.cancel.cancelled() => return Err(DownloadError::Cancelled),
        result = request => result
            .map_err(|_| DownloadError::Timeout {
                url: url.to_string(),
                secs: limits.timeout.as_secs(),
            })?
            .map_err(|e| DownloadError::HttpFailed {
                url: url.to_string(),
                source: e,
            })?,
    };

    if response.status >= 400 {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    Ok(response)
}

/// Create the partial file for the first candidate the filesystem accepts
async fn create_partial<'c>(
    directory: &Path,
    candidates: &'c [FilenameCandidate],
    title: &str,
) -> Result<(File, &'c FilenameCandidate, PathBuf, PathBuf), DownloadError> {
    let mut last_error = None;

    for candidate in candidates {
        let final_path = directory.join(candidate.file_name());
        if tokio::fs::try_exists(&final_path).await.unwrap_or(true) {
            debug!(path = %final_path.display(), "Candidate filename already taken");
            continue;
        }

        let partial_path = partial_path_for(&final_path);
        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial_path)
            .await;
        match created {
            Ok(file) => return Ok((file, candidate, final_path, partial_path)),
            Err(e) => {
                debug!(path = %partial_path.display(), error = %e, "Candidate filename rejected");
                last_error = Some(DownloadError::FileCreateFailed {
                    path: partial_path,
                    source: e,
                });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DownloadError::NoUsableFilename {
        title: title.to_string(),
    }))
}

/// Stream a body into an open file, hashing as it goes
async fn stream_to_file(
    mut file: File,
    mut body: ByteStream,
    url: &str,
    path: &Path,
    limits: &TransferLimits<'_>,
    mut on_chunk: impl FnMut(u64),
) -> Result<(u64, String), DownloadError> {
    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;

    loop {
        if limits.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = limits.cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = tokio::time::timeout(limits.timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(DownloadError::Timeout {
                    url: url.to_string(),
                    secs: limits.timeout.as_secs(),
                });
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk.map_err(|e| DownloadError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?,
        };

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        hasher.update(&chunk);

        bytes_downloaded += chunk.len() as u64;
        on_chunk(bytes_downloaded);
    }

    // Ensure all data is flushed to disk
    file.flush()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    file.sync_all()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    Ok((bytes_downloaded, format!("sha256:{:x}", hasher.finalize())))
}

async fn commit_partial(partial: &Path, final_path: &Path) -> Result<(), DownloadError> {
    if let Err(e) = tokio::fs::rename(partial, final_path).await {
        discard_partial(partial).await;
        return Err(DownloadError::RenameFailed {
            from: partial.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "Failed to remove partial download");
    }
}

/// Finish a commit interrupted after the download was recorded
///
/// Renames `<final_path>.partial` into place when only the partial file
/// exists. Returns whether anything was restored.
pub async fn restore_staged(final_path: &Path) -> std::io::Result<bool> {
    let staged = partial_path_for(final_path);
    if tokio::fs::try_exists(final_path).await? || !tokio::fs::try_exists(&staged).await? {
        return Ok(false);
    }
    tokio::fs::rename(&staged, final_path).await?;
    Ok(true)
}

/// Remove `.partial` leftovers from interrupted runs, returning how many were removed
pub async fn clean_partial_files(directory: &Path) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let is_partial = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
        if is_partial && entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::expand::ExpandContext;
    use crate::progress::NoopReporter;
    use crate::testing::{MockHttpClient, MockResponse, entry};

    use tempfile::tempdir;

    const EPISODE_URL: &str = "https://example.com/ep-1.mp3";

    fn make_episode(directory: &Path) -> Episode {
        let feed_entry = entry("ep-1", "Test Episode", Some("Mon, 15 Jan 2024 12:00:00 +0000"));
        let enclosure = feed_entry.enclosure.clone().unwrap();
        let ctx = ExpandContext {
            subscription_title: "Show",
            feed_title: "Show",
            feed_author: None,
            directory,
            rename: None,
            strategy: FilenameStrategy::Permissive,
        };
        Episode::expand_with_token(&feed_entry, &enclosure, &ctx, "abcdef123")
    }

    fn context() -> DownloadContext {
        DownloadContext {
            download_id: 0,
            episode_index: 0,
            total_to_download: 1,
        }
    }

    async fn download(
        client: &MockHttpClient,
        episode: &Episode,
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile, DownloadError> {
        let limits = TransferLimits {
            timeout: Duration::from_secs(5),
            cancel,
        };
        download_episode(
            client,
            episode,
            &episode.candidates,
            &limits,
            &context(),
            &NoopReporter::shared(),
        )
        .await
    }

    #[tokio::test]
    async fn download_writes_file_and_hash() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut response = MockResponse::ok("test audio ");
        response.chunks.push(b"content".to_vec());
        client.respond(EPISODE_URL, response);
        let episode = make_episode(dir.path());

        let file = download(&client, &episode, &CancellationToken::new()).await.unwrap();
        assert!(!file.path.exists());
        assert_eq!(file.staged_path, dir.path().join("ep-1.mp3.partial"));
        file.commit().await.unwrap();

        assert_eq!(file.bytes, 18);
        assert_eq!(file.path, dir.path().join("ep-1.mp3"));
        assert_eq!(file.strategy, FilenameStrategy::Permissive);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"test audio content");
        assert_eq!(
            file.content_hash,
            format!("sha256:{:x}", Sha256::digest(b"test audio content"))
        );
        assert!(!dir.path().join("ep-1.mp3.partial").exists());
    }

    #[tokio::test]
    async fn download_fails_on_http_error() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        client.respond(EPISODE_URL, MockResponse::status(404));
        let episode = make_episode(dir.path());

        let result = download(&client, &episode, &CancellationToken::new()).await;

        match result.unwrap_err() {
            DownloadError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("Expected HttpStatus error, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn existing_file_moves_to_next_candidate() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ep-1.mp3"), b"someone else").unwrap();
        let client = MockHttpClient::new();
        client.respond(EPISODE_URL, MockResponse::ok("audio"));
        let episode = make_episode(dir.path());

        let file = download(&client, &episode, &CancellationToken::new()).await.unwrap();
        file.commit().await.unwrap();

        assert_eq!(file.strategy, FilenameStrategy::Fallback);
        assert_eq!(file.path, dir.path().join("2024-01-15-abcdef123.mp3"));
        assert_eq!(std::fs::read(dir.path().join("ep-1.mp3")).unwrap(), b"someone else");
    }

    #[tokio::test]
    async fn staged_name_in_use_moves_to_next_candidate() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ep-1.mp3.partial"), b"in flight").unwrap();
        let client = MockHttpClient::new();
        client.respond(EPISODE_URL, MockResponse::ok("audio"));
        let episode = make_episode(dir.path());

        let file = download(&client, &episode, &CancellationToken::new()).await.unwrap();

        assert_eq!(file.strategy, FilenameStrategy::Fallback);
        assert_eq!(std::fs::read(dir.path().join("ep-1.mp3.partial")).unwrap(), b"in flight");
    }

    #[tokio::test]
    async fn interrupted_commit_is_restored() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("ep-1.mp3");
        std::fs::write(dir.path().join("ep-1.mp3.partial"), b"audio").unwrap();

        assert!(restore_staged(&final_path).await.unwrap());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"audio");
        assert!(!dir.path().join("ep-1.mp3.partial").exists());

        // Nothing left to restore
        assert!(!restore_staged(&final_path).await.unwrap());
    }

    #[tokio::test]
    async fn unwritable_names_fall_through_to_error() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        client.respond(EPISODE_URL, MockResponse::ok("audio"));
        let episode = make_episode(&dir.path().join("missing"));

        let result = download(&client, &episode, &CancellationToken::new()).await;

        assert!(matches!(result, Err(DownloadError::FileCreateFailed { .. })));
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_file() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        client.respond(EPISODE_URL, MockResponse::ok("audio"));
        let episode = make_episode(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = download(&client, &episode, &cancel).await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cover_extension_follows_mime_type() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut response = MockResponse::ok("png bytes");
        response.content_type = Some("image/png; charset=binary".to_string());
        client.respond("https://example.com/cover", response);
        let cancel = CancellationToken::new();
        let limits = TransferLimits {
            timeout: Duration::from_secs(5),
            cancel: &cancel,
        };
        let url = Url::parse("https://example.com/cover").unwrap();

        let path = download_cover(&client, &url, dir.path(), &limits).await.unwrap();

        assert_eq!(path, dir.path().join("cover.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"png bytes");
    }

    #[tokio::test]
    async fn cover_with_unknown_mime_fails() {
        let dir = tempdir().unwrap();
        let client = MockHttpClient::new();
        let mut response = MockResponse::ok("?");
        response.content_type = Some("text/html".to_string());
        client.respond("https://example.com/cover", response);
        let cancel = CancellationToken::new();
        let limits = TransferLimits {
            timeout: Duration::from_secs(5),
            cancel: &cancel,
        };
        let url = Url::parse("https://example.com/cover").unwrap();

        let result = download_cover(&client, &url, dir.path(), &limits).await;

        assert!(matches!(result, Err(DownloadError::UnknownImageType { .. })));
    }

    #[tokio::test]
    async fn partial_leftovers_are_cleaned() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3.partial"), b"x").unwrap();
        std::fs::write(dir.path().join("b.mp3"), b"x").unwrap();

        let removed = clean_partial_files(dir.path()).await.unwrap();

        assert_eq!(removed, 1);
        assert!(dir.path().join("b.mp3").exists());
        assert!(!dir.path().join("a.mp3.partial").exists());
    }
}
