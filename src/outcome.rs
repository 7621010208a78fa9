use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::DownloadError;

/// Result of a side-effecting operation as seen by reporting code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome<T = ()> {
    Success(T),
    Failed { reason: String },
    Cancelled,
}

impl<T> ActionOutcome<T> {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

impl<T> From<Result<T, DownloadError>> for ActionOutcome<T> {
    fn from(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(DownloadError::Cancelled) => Self::Cancelled,
            Err(e) => Self::failed(e),
        }
    }
}

/// The kind of file operation performed for an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeAction {
    Acquire,
    Remove,
}

/// Terminal state of one episode action
#[derive(Debug, Clone)]
pub struct EpisodeReport {
    pub id: String,
    pub title: String,
    pub action: EpisodeAction,
    /// Final path of the file that was written or deleted
    pub outcome: ActionOutcome<PathBuf>,
    /// Set when the file was downloaded but tagging it failed
    pub tag_warning: Option<String>,
}

/// An episode whose file disappeared outside of the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotedEpisode {
    pub id: String,
    pub title: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Feed was fetched and the plan executed
    Updated,
    /// Server reported no changes since the last run
    Unchanged,
    /// Subscription was skipped for this run
    Failed { reason: String },
    /// Run was cancelled before or during this subscription
    Cancelled,
}

/// Everything that happened to one subscription during a run
#[derive(Debug, Clone)]
pub struct SubscriptionReport {
    pub title: String,
    pub status: SubscriptionStatus,
    pub episodes: Vec<EpisodeReport>,
    pub user_deleted: Vec<NotedEpisode>,
    /// New location reported by a permanent redirect
    pub moved_to: Option<Url>,
    /// Advisory problems that did not affect file-level correctness
    pub warnings: Vec<String>,
}

impl SubscriptionReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: SubscriptionStatus::Updated,
            episodes: Vec::new(),
            user_deleted: Vec::new(),
            moved_to: None,
            warnings: Vec::new(),
        }
    }

    fn with_outcome(
        &self,
        action: EpisodeAction,
        pred: fn(&ActionOutcome<PathBuf>) -> bool,
    ) -> impl Iterator<Item = &EpisodeReport> {
        self.episodes
            .iter()
            .filter(move |e| e.action == action && pred(&e.outcome))
    }

    pub fn downloaded(&self) -> impl Iterator<Item = &EpisodeReport> {
        self.with_outcome(EpisodeAction::Acquire, ActionOutcome::is_success)
    }

    pub fn removed(&self) -> impl Iterator<Item = &EpisodeReport> {
        self.with_outcome(EpisodeAction::Remove, ActionOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &EpisodeReport> {
        self.episodes.iter().filter(|e| e.outcome.is_failed())
    }

    pub fn has_failures(&self) -> bool {
        matches!(self.status, SubscriptionStatus::Failed { .. }) || self.failed().next().is_some()
    }
}

/// Aggregate of all subscription reports, in configuration order
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub subscriptions: Vec<SubscriptionReport>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.subscriptions.iter().any(SubscriptionReport::has_failures)
    }

    pub fn downloaded_count(&self) -> usize {
        self.subscriptions.iter().map(|s| s.downloaded().count()).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.subscriptions.iter().map(|s| s.removed().count()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.subscriptions.iter().map(|s| s.failed().count()).sum()
    }
}
