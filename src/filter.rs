use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// A config value that may be written as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Text(String),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Int(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }
}

/// Filter settings as written in the configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Regex searched in the enclosure's original filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Regex searched in the entry title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Publish hour (UTC), 0-23
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<Scalar>,
    /// Digits of allowed publish weekdays, 0 = Monday
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<Scalar>,
    /// Only entries published after this `YYYY-MM-DD` date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_date: Option<String>,
}

impl FilterConfig {
    /// Fill unset filters from `defaults`
    pub fn or(self, defaults: &FilterConfig) -> FilterConfig {
        FilterConfig {
            filename: self.filename.or_else(|| defaults.filename.clone()),
            title: self.title.or_else(|| defaults.title.clone()),
            hour: self.hour.or_else(|| defaults.hour.clone()),
            weekdays: self.weekdays.or_else(|| defaults.weekdays.clone()),
            after_date: self.after_date.or_else(|| defaults.after_date.clone()),
        }
    }
}

/// What a filter looks at for one entry
#[derive(Debug, Clone, Copy)]
pub struct FilterSubject<'a> {
    pub filename: &'a str,
    pub title: &'a str,
    pub published: Option<DateTime<FixedOffset>>,
}

/// Compiled, conjunctive set of filters
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filename: Option<Regex>,
    title: Option<Regex>,
    hour: Option<u32>,
    /// Indexed by days from Monday
    weekdays: Option<[bool; 7]>,
    after: Option<DateTime<Utc>>,
}

impl FilterSet {
    pub fn compile(config: &FilterConfig) -> Result<Self, FilterError> {
        let regex = |filter: &'static str, pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|source| FilterError::Regex { filter, source })
        };

        Ok(Self {
            filename: regex("filename", &config.filename)?,
            title: regex("title", &config.title)?,
            hour: config.hour.as_ref().map(parse_hour).transpose()?,
            weekdays: config.weekdays.as_ref().map(parse_weekdays).transpose()?,
            after: config.after_date.as_deref().map(parse_after_date).transpose()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.filename.is_none()
            && self.title.is_none()
            && self.hour.is_none()
            && self.weekdays.is_none()
            && self.after.is_none()
    }

    /// Whether the entry passes every active filter
    ///
    /// Date-based filters exclude entries without a publish date.
    pub fn matches(&self, subject: &FilterSubject<'_>) -> bool {
        if let Some(re) = &self.filename
            && !re.is_match(subject.filename)
        {
            return false;
        }
        if let Some(re) = &self.title
            && !re.is_match(subject.title)
        {
            return false;
        }

        let needs_date = self.hour.is_some() || self.weekdays.is_some() || self.after.is_some();
        if !needs_date {
            return true;
        }
        let Some(published) = subject.published.map(|p| p.with_timezone(&Utc)) else {
            return false;
        };

        if let Some(hour) = self.hour
            && published.hour() != hour
        {
            return false;
        }
        if let Some(days) = self.weekdays
            && !days[published.weekday().num_days_from_monday() as usize]
        {
            return false;
        }
        if let Some(after) = self.after
            && published <= after
        {
            return false;
        }

        true
    }
}

fn parse_hour(value: &Scalar) -> Result<u32, FilterError> {
    let text = value.as_text();
    text.parse::<u32>()
        .ok()
        .filter(|hour| *hour < 24)
        .ok_or(FilterError::Hour { value: text })
}

fn parse_weekdays(value: &Scalar) -> Result<[bool; 7], FilterError> {
    let text = value.as_text();
    let mut days = [false; 7];

    if text.is_empty() {
        return Err(FilterError::Weekdays { value: text });
    }
    for c in text.chars() {
        match c.to_digit(10) {
            Some(day) if day < 7 => days[day as usize] = true,
            _ => return Err(FilterError::Weekdays { value: text }),
        }
    }

    Ok(days)
}

fn parse_after_date(value: &str) -> Result<DateTime<Utc>, FilterError> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|source| {
        FilterError::Date {
            value: value.to_string(),
            source,
        }
    })?;
    Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(filename: &'a str, title: &'a str, date: Option<&str>) -> FilterSubject<'a> {
        FilterSubject {
            filename,
            title,
            published: date.map(|d| DateTime::parse_from_rfc2822(d).unwrap()),
        }
    }

    // Mon, 15 Jan 2024 is a Monday
    const MONDAY_NOON: &str = "Mon, 15 Jan 2024 12:00:00 +0000";

    #[test]
    fn empty_config_matches_everything() {
        let filters = FilterSet::compile(&FilterConfig::default()).unwrap();

        assert!(filters.is_empty());
        assert!(filters.matches(&subject("a.mp3", "A", None)));
    }

    #[test]
    fn regex_filters_search_anywhere() {
        let filters = FilterSet::compile(&FilterConfig {
            title: Some("(?i)bonus".to_string()),
            filename: Some(r"\.mp3$".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(filters.matches(&subject("x.mp3", "A BONUS episode", None)));
        assert!(!filters.matches(&subject("x.m4a", "A BONUS episode", None)));
        assert!(!filters.matches(&subject("x.mp3", "Regular", None)));
    }

    #[test]
    fn hour_is_compared_in_utc() {
        let filters = FilterSet::compile(&FilterConfig {
            hour: Some(Scalar::Int(12)),
            ..Default::default()
        })
        .unwrap();

        assert!(filters.matches(&subject("a", "a", Some(MONDAY_NOON))));
        assert!(filters.matches(&subject("a", "a", Some("Mon, 15 Jan 2024 14:00:00 +0200"))));
        assert!(!filters.matches(&subject("a", "a", Some("Mon, 15 Jan 2024 13:00:00 +0000"))));
    }

    #[test]
    fn weekdays_start_at_monday() {
        let filters = FilterSet::compile(&FilterConfig {
            weekdays: Some(Scalar::Text("06".to_string())),
            ..Default::default()
        })
        .unwrap();

        assert!(filters.matches(&subject("a", "a", Some(MONDAY_NOON))));
        assert!(filters.matches(&subject("a", "a", Some("Sun, 21 Jan 2024 12:00:00 +0000"))));
        assert!(!filters.matches(&subject("a", "a", Some("Tue, 16 Jan 2024 12:00:00 +0000"))));
    }

    #[test]
    fn after_date_is_strictly_after_midnight() {
        let filters = FilterSet::compile(&FilterConfig {
            after_date: Some("2024-01-15".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(filters.matches(&subject("a", "a", Some(MONDAY_NOON))));
        assert!(!filters.matches(&subject("a", "a", Some("Mon, 15 Jan 2024 00:00:00 +0000"))));
        assert!(!filters.matches(&subject("a", "a", Some("Sun, 14 Jan 2024 23:00:00 +0000"))));
    }

    #[test]
    fn date_filters_exclude_undated_entries() {
        let filters = FilterSet::compile(&FilterConfig {
            weekdays: Some(Scalar::Int(123)),
            ..Default::default()
        })
        .unwrap();

        assert!(!filters.matches(&subject("a", "a", None)));
    }

    #[test]
    fn malformed_values_fail_compilation() {
        let bad = [
            FilterConfig {
                title: Some("(unclosed".to_string()),
                ..Default::default()
            },
            FilterConfig {
                hour: Some(Scalar::Int(24)),
                ..Default::default()
            },
            FilterConfig {
                hour: Some(Scalar::Text("noon".to_string())),
                ..Default::default()
            },
            FilterConfig {
                weekdays: Some(Scalar::Text("17".to_string())),
                ..Default::default()
            },
            FilterConfig {
                after_date: Some("15/01/2024".to_string()),
                ..Default::default()
            },
        ];

        for config in bad {
            assert!(FilterSet::compile(&config).is_err(), "{config:?} should not compile");
        }
    }

    #[test]
    fn filter_that_excludes_everything_is_not_an_error() {
        let filters = FilterSet::compile(&FilterConfig {
            title: Some("^$never".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(!filters.matches(&subject("a", "anything", None)));
    }

    #[test]
    fn defaults_fill_unset_filters() {
        let defaults = FilterConfig {
            hour: Some(Scalar::Int(5)),
            title: Some("default".to_string()),
            ..Default::default()
        };
        let own = FilterConfig {
            title: Some("own".to_string()),
            ..Default::default()
        };

        let merged = own.or(&defaults);

        assert_eq!(merged.title.as_deref(), Some("own"));
        assert_eq!(merged.hour, Some(Scalar::Int(5)));
    }
}
