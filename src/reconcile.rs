// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides which episodes a subscription should hold after this run.
//!
//! The feed and the history are merged into one priority order, filtered
//! and truncated. Whatever survives and is not stored yet gets acquired;
//! whatever is stored but did not survive gets removed.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::debug;
use url::Url;

use crate::config::Subscription;
use crate::episode::{Episode, ExpandContext, FilenameStrategy, RenameTemplate};
use crate::error::SubscriptionError;
use crate::feed::{FeedEntry, FetchedFeed};
use crate::filter::{FilterSet, FilterSubject};
use crate::history::{HistoryRecord, StoredEpisode};
use crate::http::CacheTokens;

/// A new episode to download
#[derive(Debug, Clone)]
pub struct Acquisition {
    /// Position in the priority order
    pub rank: usize,
    pub episode: Episode,
    /// Shares its first filename with another episode; only the fallback is tried
    pub non_unique: bool,
}

/// What one run should do to a subscription
#[derive(Debug, Clone)]
pub struct SyncPlan {
    /// Rank of every surviving episode id
    pub priority: HashMap<String, usize>,
    /// In priority order
    pub to_acquire: Vec<Acquisition>,
    /// In stored order
    pub to_remove: Vec<StoredEpisode>,
    /// Stored and still wanted, left untouched
    pub unchanged: Vec<String>,
    pub cache: CacheTokens,
    pub image_url: Option<Url>,
    /// Every id the feed carried, for pruning the blocked set
    pub feed_ids: HashSet<String>,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.to_acquire.is_empty() && self.to_remove.is_empty()
    }
}

/// An entry of the merged feed and history order
#[derive(Debug, Clone, Copy)]
enum Candidate<'a> {
    Stored(&'a StoredEpisode),
    New(&'a FeedEntry),
}

impl<'a> Candidate<'a> {
    fn id(&self) -> &'a str {
        match *self {
            Candidate::Stored(stored) => &stored.id,
            Candidate::New(entry) => &entry.id,
        }
    }

    fn subject(&self) -> FilterSubject<'a> {
        match *self {
            Candidate::Stored(stored) => FilterSubject {
                filename: stored
                    .variables
                    .get("filename")
                    .map(String::as_str)
                    .unwrap_or_else(|| url_filename(&stored.url)),
                title: &stored.title,
                published: stored.published,
            },
            Candidate::New(entry) => FilterSubject {
                filename: entry
                    .enclosure
                    .as_ref()
                    .map(|enclosure| url_filename(&enclosure.url))
                    .unwrap_or(""),
                title: &entry.title,
                published: entry.published,
            },
        }
    }
}

/// Raw last path segment, matching what the filename filter sees for stored episodes
/// without recorded variables
fn url_filename(url: &Url) -> &str {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("")
}

/// Merge feed and history into one ordering.
///
/// Oldest-first puts the history first and appends new feed entries;
/// otherwise the feed leads and stored episodes it no longer carries follow.
/// Entries without an enclosure and blocked ids are dropped here.
fn union<'a>(
    feed: &'a [FeedEntry],
    record: &'a HistoryRecord,
    oldest_first: bool,
) -> Vec<Candidate<'a>> {
    let stored: Vec<Candidate<'a>> = record.episodes().map(Candidate::Stored).collect();
    let fresh: Vec<Candidate<'a>> = feed
        .iter()
        .map(|entry| match record.get(&entry.id) {
            Some(stored) => Candidate::Stored(stored),
            None => Candidate::New(entry),
        })
        .collect();
    let (leading, trailing) = if oldest_first {
        (stored, fresh)
    } else {
        (fresh, stored)
    };

    let mut seen: HashSet<&str> = HashSet::new();
    leading
        .into_iter()
        .chain(trailing)
        .filter(|candidate| seen.insert(candidate.id()))
        .filter(|candidate| match candidate {
            Candidate::Stored(_) => true,
            Candidate::New(entry) => {
                entry.enclosure.is_some() && !record.blocked.contains(&entry.id)
            }
        })
        .collect()
}

/// Compute the plan for one subscription.
///
/// Fails when a filter or the rename template cannot be used.
pub fn reconcile(
    subscription: &Subscription,
    strategy: FilenameStrategy,
    directory: &Path,
    feed: &FetchedFeed,
    record: &HistoryRecord,
) -> Result<SyncPlan, SubscriptionError> {
    let filters = FilterSet::compile(&subscription.filters)?;
    let rename = subscription
        .rename
        .as_deref()
        .map(RenameTemplate::parse)
        .transpose()?;

    let snapshot = &feed.snapshot;
    let mut survivors: Vec<Candidate<'_>> = union(&snapshot.entries, record, subscription.from_the_top)
        .into_iter()
        .filter(|candidate| filters.matches(&candidate.subject()))
        .collect();
    if let Some(max) = subscription.max_number {
        survivors.truncate(max);
    }

    let priority: HashMap<String, usize> = survivors
        .iter()
        .enumerate()
        .map(|(rank, candidate)| (candidate.id().to_string(), rank))
        .collect();

    let ctx = ExpandContext {
        subscription_title: &subscription.title,
        feed_title: &snapshot.title,
        feed_author: snapshot.author.as_deref(),
        directory,
        rename: rename.as_ref(),
        strategy,
    };

    let mut unchanged = Vec::new();
    let mut expanded = Vec::new();
    for (rank, candidate) in survivors.iter().enumerate() {
        match candidate {
            Candidate::Stored(stored) => unchanged.push(stored.id.clone()),
            Candidate::New(entry) => {
                if let Some(enclosure) = &entry.enclosure {
                    expanded.push((rank, Episode::expand(entry, enclosure, &ctx)));
                }
            }
        }
    }

    // Collisions are judged on the first candidate across every survivor
    let mut name_counts: HashMap<String, usize> = HashMap::new();
    for candidate in &survivors {
        if let Candidate::Stored(stored) = candidate
            && let Some(name) = stored.path.file_name()
        {
            *name_counts.entry(name.to_string_lossy().to_lowercase()).or_default() += 1;
        }
    }
    for (_, episode) in &expanded {
        *name_counts.entry(episode.first_file_name().to_lowercase()).or_default() += 1;
    }

    let to_acquire: Vec<Acquisition> = expanded
        .into_iter()
        .map(|(rank, episode)| {
            let non_unique = name_counts
                .get(&episode.first_file_name().to_lowercase())
                .is_some_and(|&count| count > 1);
            Acquisition {
                rank,
                episode,
                non_unique,
            }
        })
        .collect();

    let to_remove: Vec<StoredEpisode> = record
        .episodes()
        .filter(|stored| !priority.contains_key(&stored.id))
        .cloned()
        .collect();

    debug!(
        subscription = %subscription.title,
        acquire = to_acquire.len(),
        remove = to_remove.len(),
        unchanged = unchanged.len(),
        "Reconciled subscription"
    );

    Ok(SyncPlan {
        priority,
        to_acquire,
        to_remove,
        unchanged,
        cache: feed.cache.clone(),
        image_url: snapshot.image_url.clone(),
        feed_ids: snapshot.entries.iter().map(|entry| entry.id.clone()).collect(),
    })
}
