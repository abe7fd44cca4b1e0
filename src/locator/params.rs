//! Query parameter helpers shared by both locator kinds.
//!
//! Positional parameters are rewritten in place with a regex so the rest of
//! the (signed) query string keeps its exact bytes and order.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::LocatorError;

#[allow(clippy::expect_used)]
static RANGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([?&]range=)(\d+)-(\d+)").expect("range regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static SEGMENT_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([?&]sq=)(\d+)").expect("sq regex is valid") // Static pattern, safe to panic
});

/// Decoded query parameters of a locator URL (first value wins).
#[derive(Debug)]
pub(crate) struct QueryParams {
    url: String,
    values: HashMap<String, String>,
}

impl QueryParams {
    pub(crate) fn parse(raw: &str) -> Result<Self, LocatorError> {
        let parsed = Url::parse(raw).map_err(|_| LocatorError::unsupported(raw))?;
        let mut values = HashMap::new();
        for (key, value) in parsed.query_pairs() {
            values
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        Ok(Self {
            url: raw.to_string(),
            values,
        })
    }

    pub(crate) fn contains_all(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.values.contains_key(*name))
    }

    pub(crate) fn text(&self, name: &'static str) -> Result<String, LocatorError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| LocatorError::missing(&self.url, name))
    }

    pub(crate) fn number(&self, name: &'static str) -> Result<u64, LocatorError> {
        self.values
            .get(name)
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| LocatorError::missing(&self.url, name))
    }
}

/// Extracts the inclusive byte range embedded in a chunk URL.
pub(crate) fn parse_range(url: &str) -> Option<(u64, u64)> {
    let caps = RANGE_PARAM.captures(url)?;
    let start = caps.get(2)?.as_str().parse().ok()?;
    let end = caps.get(3)?.as_str().parse().ok()?;
    Some((start, end))
}

/// Returns `url` with its `range` parameter replaced by `start-end`.
pub(crate) fn with_range(url: &str, start: u64, end: u64) -> String {
    RANGE_PARAM
        .replace(url, |caps: &regex::Captures<'_>| {
            format!("{}{start}-{end}", &caps[1])
        })
        .into_owned()
}

/// Extracts the segment index embedded in a chunk URL.
pub(crate) fn parse_segment_index(url: &str) -> Option<u64> {
    SEGMENT_PARAM.captures(url)?.get(2)?.as_str().parse().ok()
}

/// Returns `url` with its `sq` parameter replaced by `index`.
pub(crate) fn with_segment_index(url: &str, index: u64) -> String {
    SEGMENT_PARAM
        .replace(url, |caps: &regex::Captures<'_>| format!("{}{index}", &caps[1]))
        .into_owned()
}
