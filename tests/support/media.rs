//! Fake stream endpoints.
//!
//! `RangeBody` serves `range=a-b` windows of a byte buffer. `SegmentBody`
//! serves `sq=<n>` segments on GET and their `Content-Length` on HEAD.

use std::time::Duration;

use wiremock::{Request, Respond, ResponseTemplate};

/// Expiry far in the future (2100-01-01).
pub const FAR_EXPIRY: u64 = 4_102_444_800;

/// Expiry in the past.
pub const PAST_EXPIRY: u64 = 1;

/// Per-response delay of a slow server.
pub const SLOW_CHUNK: Duration = Duration::from_millis(150);

fn query(request: &Request, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub struct RangeBody(pub Vec<u8>);

impl RangeBody {
    /// Same server, answering every request after [`SLOW_CHUNK`].
    pub fn delayed(self) -> Delayed<Self> {
        Delayed(self, SLOW_CHUNK)
    }
}

pub struct Delayed<R>(R, Duration);

impl<R: Respond> Respond for Delayed<R> {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.0.respond(request).set_delay(self.1)
    }
}

impl Respond for RangeBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let window = query(request, "range").and_then(|range| {
            let (start, end) = range.split_once('-')?;
            Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
        });
        match window {
            Some((start, end)) if start < self.0.len() => {
                let end = end.min(self.0.len() - 1);
                ResponseTemplate::new(200).set_body_bytes(self.0[start..=end].to_vec())
            }
            _ => ResponseTemplate::new(416),
        }
    }
}

pub struct SegmentBody(pub Vec<Vec<u8>>);

impl SegmentBody {
    /// Segments whose first one announces the count, as the real servers do.
    pub fn with_header(tail: &[&[u8]]) -> Self {
        let mut segments = vec![format!("Segment-Count: {}\r\n", tail.len()).into_bytes()];
        segments.extend(tail.iter().map(|s| s.to_vec()));
        Self(segments)
    }

    pub fn concat(&self) -> Vec<u8> {
        self.0.concat()
    }
}

impl Respond for SegmentBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let segment = query(request, "sq")
            .and_then(|sq| sq.parse::<usize>().ok())
            .and_then(|index| self.0.get(index));
        let Some(segment) = segment else {
            return ResponseTemplate::new(404);
        };
        if request.method.as_str() == "HEAD" {
            ResponseTemplate::new(200).insert_header("Content-Length", segment.len().to_string())
        } else {
            ResponseTemplate::new(200).set_body_bytes(segment.clone())
        }
    }
}

pub fn range_url(base: &str, path: &str, mime: &str, clen: usize, expire: u64, sig: &str) -> String {
    let mime = mime.replace('/', "%2F");
    format!("{base}{path}?expire={expire}&mime={mime}&clen={clen}&range=0-0&sig={sig}&rn=1")
}

pub fn segment_url(base: &str, path: &str, mime: &str, expire: u64, sig: &str) -> String {
    let mime = mime.replace('/', "%2F");
    format!("{base}{path}?expire={expire}&mime={mime}&source=yt_otf&sq=0&sig={sig}&rn=1")
}
