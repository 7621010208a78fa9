// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::error::FeedError;

/// Represents a parsed feed, entries in document order
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub title: String,
    pub author: Option<String>,
    pub image_url: Option<Url>,
    pub entries: Vec<FeedEntry>,
}

/// Represents a single feed entry
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// GUID, falling back to the raw enclosure URL
    pub id: String,
    pub title: String,
    pub published: Option<DateTime<FixedOffset>>,
    pub author: Option<String>,
    /// Absent when the item has no enclosure or its URL does not parse
    pub enclosure: Option<Enclosure>,
}

/// Represents the audio file attached to an entry
#[derive(Debug, Clone, PartialEq)]
pub struct Enclosure {
    pub url: Url,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

/// Parse RSS feed XML bytes into a FeedSnapshot
pub fn parse_feed(xml_bytes: &[u8]) -> Result<FeedSnapshot, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let entries = channel.items().iter().filter_map(parse_entry).collect();

    let image_url = channel
        .image()
        .and_then(|img| Url::parse(img.url()).ok())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .and_then(|url| Url::parse(url).ok())
        });

    let author = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    Ok(FeedSnapshot {
        title: decode_text(channel.title()),
        author,
        image_url,
        entries,
    })
}

/// Items without a GUID or an enclosure URL cannot be identified and are dropped
fn parse_entry(item: &rss::Item) -> Option<FeedEntry> {
    let raw_enclosure = item.enclosure();

    let id = item
        .guid()
        .map(|g| g.value().trim().to_string())
        .filter(|g| !g.is_empty())
        .or_else(|| raw_enclosure.map(|e| e.url().to_string()))?;

    let title = item
        .title()
        .map(decode_text)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let enclosure = raw_enclosure.and_then(|enclosure| {
        Some(Enclosure {
            url: Url::parse(enclosure.url()).ok()?,
            length: enclosure.length().parse().ok().filter(|&len: &u64| len > 0),
            mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
        })
    });

    let published = item.pub_date().and_then(|date_str| {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .or_else(|| parse_relaxed_date(date_str))
    });

    let author = item
        .author()
        .map(String::from)
        .or_else(|| item.itunes_ext().and_then(|ext| ext.author().map(String::from)));

    Some(FeedEntry {
        id,
        title,
        published,
        author,
        enclosure,
    })
}

/// Some feeds double-escape entities in their text nodes
fn decode_text(text: &str) -> String {
    html_escape::decode_html_entities(text.trim()).into_owned()
}

/// Try to parse dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date_str.trim()).ok())
}
