//! Shared fixtures for unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use url::Url;

use crate::feed::{Enclosure, FeedEntry};
use crate::http::{ByteStream, CacheTokens, FeedResponse, HttpClient, HttpResponse};

/// Canned response for one URL
#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub location: Option<String>,
    pub cache: CacheTokens,
    pub content_type: Option<String>,
    pub chunks: Vec<Vec<u8>>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            location: None,
            cache: CacheTokens::default(),
            content_type: None,
            chunks: vec![body.into()],
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            chunks: vec![],
            ..Self::ok(Vec::new())
        }
    }
}

/// HTTP client serving canned responses and recording requests
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, MockResponse>>>,
    /// Every URL requested together with the cache tokens sent
    pub requests: Arc<Mutex<Vec<(String, CacheTokens)>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    fn lookup(&self, url: &str, cache: CacheTokens) -> MockResponse {
        self.requests.lock().unwrap().push((url.to_string(), cache));
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| MockResponse::status(404))
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get_feed(
        &self,
        url: &str,
        cache: &CacheTokens,
    ) -> Result<FeedResponse, reqwest::Error> {
        let response = self.lookup(url, cache.clone());
        Ok(FeedResponse {
            status: response.status,
            location: response.location,
            cache: response.cache,
            body: Bytes::from(response.chunks.concat()),
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let response = self.lookup(url, CacheTokens::default());
        let len = response.chunks.iter().map(Vec::len).sum::<usize>() as u64;
        let chunks: Vec<Result<Bytes, reqwest::Error>> = response
            .chunks
            .into_iter()
            .map(|chunk| Ok(Bytes::from(chunk)))
            .collect();
        let body: ByteStream = Box::pin(futures::stream::iter(chunks));

        Ok(HttpResponse {
            status: response.status,
            content_length: Some(len),
            content_type: response.content_type,
            body,
        })
    }
}

/// Build a feed entry with an enclosure under example.com
pub fn entry(id: &str, title: &str, date: Option<&str>) -> FeedEntry {
    FeedEntry {
        id: id.to_string(),
        title: title.to_string(),
        published: date.and_then(|d| DateTime::parse_from_rfc2822(d).ok()),
        author: None,
        enclosure: Some(Enclosure {
            url: Url::parse(&format!("https://example.com/{id}.mp3")).unwrap(),
            length: None,
            mime_type: Some("audio/mpeg".to_string()),
        }),
    }
}

/// Render a minimal RSS document for the given (guid, title) pairs
pub fn rss_feed(items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><title>{title}</title><guid>{guid}</guid>\
                 <pubDate>Mon, 15 Jan 2024 12:00:00 +0000</pubDate>\
                 <enclosure url=\"https://example.com/{guid}.mp3\" type=\"audio/mpeg\"/></item>"
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>Test Podcast</title>\
         <description>Test</description>{items}</channel></rss>"
    )
}
