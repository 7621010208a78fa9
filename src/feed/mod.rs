mod fetch;
mod parse;

pub use fetch::{FetchOutcome, FetchRequest, FetchedFeed, fetch_feed};
pub use parse::{Enclosure, FeedEntry, FeedSnapshot, parse_feed};
