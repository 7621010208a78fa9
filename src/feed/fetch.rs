// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::error::FeedError;
use crate::http::{CacheTokens, FeedResponse, HttpClient};

use super::parse::{FeedSnapshot, parse_feed};

/// Redirect hops followed before giving up on a feed
const MAX_REDIRECTS: usize = 5;

/// A successfully fetched feed together with its new caching tokens
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// Entries in processing order (reversed when oldest-first is requested)
    pub snapshot: FeedSnapshot,
    pub cache: CacheTokens,
}

/// Classified result of fetching one subscription's feed
#[derive(Debug)]
pub enum FetchOutcome {
    /// Server reported nothing new since the cached tokens
    Unchanged,
    /// Feed permanently moved; `feed` is set when the new location also returned entries
    Moved {
        location: Url,
        feed: Option<FetchedFeed>,
    },
    /// Transport error, HTTP error status or unparseable document
    Failed(FeedError),
    Fetched(FetchedFeed),
}

/// Request parameters for one feed fetch
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a Url,
    pub cache: &'a CacheTokens,
    /// Ignore the cached tokens and always download the full document
    pub force_refresh: bool,
    pub oldest_first: bool,
    pub timeout: Duration,
}

/// Fetch and classify a subscription's feed
pub async fn fetch_feed<C: HttpClient>(client: &C, request: &FetchRequest<'_>) -> FetchOutcome {
    let cache = if request.force_refresh {
        CacheTokens::default()
    } else {
        request.cache.clone()
    };

    let (response, final_url, location) = match follow_redirects(client, request, &cache).await {
        Ok(result) => result,
        Err(e) => return FetchOutcome::Failed(e),
    };

    let feed = match response.status {
        304 => None,
        status if status >= 400 => {
            return FetchOutcome::Failed(FeedError::HttpStatus {
                url: final_url.to_string(),
                status,
            });
        }
        _ => {
            let mut snapshot = match parse_feed(&response.body) {
                Ok(snapshot) => snapshot,
                Err(e) => return FetchOutcome::Failed(e),
            };
            if request.oldest_first {
                snapshot.entries.reverse();
            }
            Some(FetchedFeed {
                snapshot,
                cache: CacheTokens {
                    etag: response.cache.etag.or(cache.etag),
                    last_modified: response.cache.last_modified.or(cache.last_modified),
                },
            })
        }
    };

    match (location, feed) {
        (Some(location), feed) => FetchOutcome::Moved { location, feed },
        (None, Some(feed)) => FetchOutcome::Fetched(feed),
        (None, None) => FetchOutcome::Unchanged,
    }
}

/// Follow redirects by hand so permanent moves can be told apart from temporary ones.
///
/// Returns the final response, the URL it came from and the target of the
/// last permanent hop, if any.
async fn follow_redirects<C: HttpClient>(
    client: &C,
    request: &FetchRequest<'_>,
    cache: &CacheTokens,
) -> Result<(FeedResponse, Url, Option<Url>), FeedError> {
    let mut current = request.url.clone();
    let mut permanent_target: Option<Url> = None;

    for _ in 0..=MAX_REDIRECTS {
        let response = tokio::time::timeout(request.timeout, client.get_feed(current.as_str(), cache))
            .await
            .map_err(|_| FeedError::Timeout {
                url: current.to_string(),
                secs: request.timeout.as_secs(),
            })?
            .map_err(|e| FeedError::FetchFailed {
                url: current.to_string(),
                source: e,
            })?;

        if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
            return Ok((response, current, permanent_target));
        }

        let next = response
            .location
            .as_deref()
            .and_then(|location| current.join(location).ok())
            .ok_or_else(|| FeedError::BadRedirect {
                url: current.to_string(),
            })?;

        debug!(from = %current, to = %next, status = response.status, "Feed redirected");
        if matches!(response.status, 301 | 308) {
            permanent_target = Some(next.clone());
        }
        current = next;
    }

    Err(FeedError::TooManyRedirects {
        url: request.url.to_string(),
    })
}
