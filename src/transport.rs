//! Network seam between the downloader and the HTTP stack.
//!
//! The session and the segment workers only talk to a [`Transport`], which
//! keeps the concurrency logic testable without a live server.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::DownloaderConfig;
use crate::error::TransportError;
use crate::planner::ByteRange;

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response to a ranged GET.
pub struct RangeResponse {
    /// HTTP status; 206 when the range was honored, 200 when the server sent the full body.
    pub status: u16,
    pub body: BodyStream,
}

impl RangeResponse {
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT.as_u16()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Total length of the resource, `None` when the server does not say.
    async fn content_length(&self, url: &str) -> Result<Option<u64>, TransportError>;

    /// Starts a GET restricted to `range`. Non-success statuses are errors.
    async fn get_range(&self, url: &str, range: ByteRange) -> Result<RangeResponse, TransportError>;
}

/// [`Transport`] backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn content_length(&self, url: &str) -> Result<Option<u64>, TransportError> {
        // Read the header directly; hyper reports a zero body hint for HEAD responses.
        match self.client.head(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                if let Some(len) = parse_content_length(response.headers()).filter(|len| *len > 0) {
                    return Ok(Some(len));
                }
                debug!(url, "HEAD response has no Content-Length, probing with a ranged GET");
            }
            Err(e) => debug!(url, error = %e, "HEAD request failed, probing with a ranged GET"),
        }

        let response = self
            .client
            .get(url)
            .header(header::RANGE, ByteRange::new(0, 0).header_value())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        if status == StatusCode::PARTIAL_CONTENT {
            Ok(response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total))
        } else {
            Ok(parse_content_length(response.headers()))
        }
    }

    async fn get_range(&self, url: &str, range: ByteRange) -> Result<RangeResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range.header_value())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response
            .bytes_stream()
            .map(|item| item.map_err(TransportError::from))
            .boxed();

        Ok(RangeResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Total from a `Content-Range: bytes 0-0/12345` value. `*` means unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok().filter(|total| *total > 0)
}
