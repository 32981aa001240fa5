//! Origin server fetch: the fallback when no peer advertises a part.
//!
//! The origin is a plain HTTP server holding the whole media file;
//! parts and the head are fetched with byte-range requests.

use anyhow::{bail, Context, Result};
use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::media::ByteRange;

pub struct OriginClient {
    http: reqwest::Client,
    url: String,
}

impl OriginClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Fetch one inclusive byte range. The origin is expected to honor
    /// the range with a 206; a 200 with the full body is accepted from
    /// servers that ignore ranges.
    pub async fn fetch_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(&self.url)
            .header(RANGE, range.header_value())
            .send()
            .await
            .with_context(|| format!("range fetch from {}", self.url))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response.bytes().await?.to_vec()),
            StatusCode::OK => {
                let body = response.bytes().await?;
                let lo = range.lo as usize;
                let hi = (range.hi as usize + 1).min(body.len());
                if lo >= body.len() {
                    bail!("origin body shorter than requested range");
                }
                Ok(body[lo..hi].to_vec())
            }
            status => bail!("origin returned {status} for {}", range.header_value()),
        }
    }
}
