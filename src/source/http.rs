use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use super::{Anime, ByteRange, ByteStream, Episode, Hoster, RemoteFile, Source, SourceError};

/// A source reached over plain HTTP whose hoster lists are known up front
/// (typically loaded from a [`Catalog`](super::Catalog)).
#[derive(Debug, Clone)]
pub struct HttpSource {
    id: i64,
    name: String,
    client: Client,
    headers: BTreeMap<String, String>,
    hosters: HashMap<i64, Vec<Hoster>>,
}

impl HttpSource {
    pub fn new(id: i64, name: &str, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            id,
            name: name.to_string(),
            client,
            headers: BTreeMap::new(),
            hosters: HashMap::new(),
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_hosters(mut self, episode_id: i64, hosters: Vec<Hoster>) -> Self {
        self.hosters.insert(episode_id, hosters);
        self
    }

    fn request(&self, url: &str, headers: &BTreeMap<String, String>) -> RequestBuilder {
        let mut builder = self.client.get(url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

/// Total length from a `Content-Range: bytes 0-0/12345` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Source for HttpSource {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn headers(&self) -> BTreeMap<String, String> {
        self.headers.clone()
    }

    async fn hosters(&self, _anime: &Anime, episode: &Episode) -> Result<Vec<Hoster>, SourceError> {
        Ok(self.hosters.get(&episode.id).cloned().unwrap_or_default())
    }

    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<RemoteFile, SourceError> {
        let response = self
            .request(url, headers)
            .header(RANGE, ByteRange::new(0, 0).header_value())
            .send()
            .await?;

        let status = response.status();
        let remote = if status == StatusCode::PARTIAL_CONTENT {
            let length = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            RemoteFile {
                length,
                accepts_ranges: length.is_some(),
            }
        } else if status.is_success() {
            RemoteFile {
                length: response.content_length(),
                accepts_ranges: false,
            }
        } else {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        };

        debug!(
            "Probed {}: length={:?}, ranges={}",
            url, remote.length, remote.accepts_ranges
        );
        Ok(remote)
    }

    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, SourceError> {
        let mut builder = self.request(url, headers);
        if let Some(range) = range {
            builder = builder.header(RANGE, range.header_value());
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(SourceError::RangeNotHonoured {
                url: url.to_string(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SourceError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_http_source_builder() {
        let mut headers = BTreeMap::new();
        headers.insert("Referer".to_string(), "https://example.com".to_string());

        let source = HttpSource::new(7, "Example", "anidl-test")
            .unwrap()
            .with_headers(headers)
            .with_hosters(1, vec![]);

        assert_eq!(source.id(), 7);
        assert_eq!(source.name(), "Example");
        assert_eq!(source.headers().len(), 1);
    }
}
