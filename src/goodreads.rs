use crate::util::{normalize_isbn, truncate_on_char_boundary};
use anyhow::{Context, Result, anyhow};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const GOODREADS_API_BASE: &str = "https://www.goodreads.com";

/// Goodreads bookkeeping counters we never serve to readers.
const OMITTED_FIELDS: [&str; 4] = [
    "ratings_count",
    "reviews_count",
    "text_reviews_count",
    "work_text_reviews_count",
];

#[derive(Debug, Clone)]
pub struct GoodreadsClient {
    client: Client,
    api_key: String,
    base_url: Url,
}

impl GoodreadsClient {
    pub fn new(api_key: String) -> Self {
        let base_url = Self::normalize_base_url(
            Url::parse(GOODREADS_API_BASE).expect("GOODREADS_API_BASE should be a valid URL"),
        );
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_with_base_url(api_key: String, base_url: &str) -> Self {
        let base_url = Self::normalize_base_url(
            Url::parse(base_url).expect("invalid Goodreads base URL for tests"),
        );
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    fn normalize_base_url(mut base_url: Url) -> Url {
        if !base_url.path().ends_with('/') {
            let mut path = base_url.path().to_owned();
            path.push('/');
            base_url.set_path(&path);
        }
        base_url
    }

    // Fetch review counts for a whole page of ISBNs in one request. The ISBNs
    // travel as a single comma-joined `isbns` query parameter (the comma is
    // percent-encoded on the wire).
    pub async fn review_counts(&self, isbns: &[String]) -> Result<Vec<ReviewStatistic>> {
        let mut url = self.base_url.join("book/review_counts.json")?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("isbns", &isbns.join(","));
            qp.append_pair("key", &self.api_key);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send Goodreads review_counts request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Goodreads response body")?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown");
            return Err(anyhow!(
                "Goodreads API error (status {} {}): {}",
                status.as_u16(),
                reason,
                truncate(&body, 900)
            ));
        }

        let parsed: ReviewCountsResponse = serde_json::from_str(&body).map_err(|e| {
            anyhow!(
                "Failed to decode Goodreads JSON: {e}; body: {}",
                truncate(&body, 900)
            )
        })?;

        Ok(parsed.books)
    }
}

#[derive(Debug, Deserialize, Clone)]
struct ReviewCountsResponse {
    #[serde(default)]
    books: Vec<ReviewStatistic>,
}

/// One entry of the provider's `books` array. Only the identifiers are
/// modeled; every other rating field rides along in `fields` untouched.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReviewStatistic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn13: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ReviewStatistic {
    // Prefer the 13-digit identifier; entries with neither are unusable.
    pub fn cache_key(&self) -> Option<String> {
        let raw = self
            .isbn13
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.isbn.as_deref().filter(|s| !s.trim().is_empty()))?;

        let normalized = normalize_isbn(raw);
        if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        }
    }

    /// The JSON object written to the cache: the full entry minus the
    /// provider-internal counters in `OMITTED_FIELDS`.
    pub fn cached_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Value::Object(map) = &mut value {
            for field in OMITTED_FIELDS {
                map.remove(field);
            }
        }
        value
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.len() <= n {
        s.to_string()
    } else {
        let (prefix, truncated_bytes) = truncate_on_char_boundary(s, n);
        format!("{prefix}… ({} bytes truncated)", truncated_bytes)
    }
}
