// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use serde::{Deserialize, Serialize};

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Maximum number of redirects followed for enclosure downloads
const MAX_DOWNLOAD_REDIRECTS: usize = 10;

/// Feed caching validators (ETag / Last-Modified)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheTokens {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Response to a single, non-redirecting feed request
pub struct FeedResponse {
    /// HTTP status code
    pub status: u16,
    /// Location header value, present on redirects
    pub location: Option<String>,
    /// Caching validators sent by the server
    pub cache: CacheTokens,
    /// Response body (empty for 304 and redirects)
    pub body: Bytes,
}

/// HTTP response with status, content length, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present
    pub content_length: Option<u64>,
    /// Content-Type header value, if present
    pub content_type: Option<String>,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue one conditional GET for a feed without following redirects
    async fn get_feed(&self, url: &str, cache: &CacheTokens)
    -> Result<FeedResponse, reqwest::Error>;

    /// Get a streaming response for large downloads, following redirects
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error>;
}

/// Settings shared by every request the client makes
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: Option<String>,
    /// Ceiling for connection setup and for each idle read
    pub timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    feed_client: reqwest::Client,
    download_client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_options(&HttpOptions::default())
    }

    /// Create a ReqwestClient honoring a user agent override and timeouts
    pub fn with_options(options: &HttpOptions) -> Result<Self, reqwest::Error> {
        let builder = || {
            let builder = reqwest::Client::builder()
                .connect_timeout(options.timeout)
                .read_timeout(options.timeout);
            match &options.user_agent {
                Some(agent) => builder.user_agent(agent.as_str()),
                None => builder.user_agent(concat!("podjar/", env!("CARGO_PKG_VERSION"))),
            }
        };

        Ok(Self {
            feed_client: builder().redirect(reqwest::redirect::Policy::none()).build()?,
            download_client: builder()
                .redirect(reqwest::redirect::Policy::limited(MAX_DOWNLOAD_REDIRECTS))
                .build()?,
            timeout: options.timeout,
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_feed(
        &self,
        url: &str,
        cache: &CacheTokens,
    ) -> Result<FeedResponse, reqwest::Error> {
        let mut request = self.feed_client.get(url).timeout(self.timeout);
        if let Some(etag) = &cache.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(modified) = &cache.last_modified {
            request = request.header(IF_MODIFIED_SINCE, modified.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let location = header_string(headers, LOCATION);
        let cache = CacheTokens {
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
        };
        let body = response.bytes().await?;

        Ok(FeedResponse {
            status,
            location,
            cache,
            body,
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let response = self.download_client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_type = header_string(response.headers(), CONTENT_TYPE);

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(HttpResponse {
            status,
            content_length,
            content_type,
            body,
        })
    }
}
