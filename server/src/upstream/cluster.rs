//! HTTP client for the cluster API.
//!
//! [`ClusterClient`] wraps two `reqwest::Client`s: one with a whole-request
//! timeout for snapshots, and one without (watches stay open for as long as
//! the relay wants them). Watch responses are newline-delimited JSON, one
//! [`WatchEvent`] per line, decoded by [`ndjson_events`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::{ResourcePath, Upstream, UpstreamError, WatchEvent, WatchStream};
use crate::config::UpstreamConfig;

/// Cluster API client.
pub struct ClusterClient {
    http: reqwest::Client,
    watch_http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ClusterClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let watch_http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            watch_http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, client: &reqwest::Client, path: &ResourcePath) -> reqwest::RequestBuilder {
        let mut req = client
            .get(format!("{}{}", self.base_url, path.path()))
            .query(&path.query().iter().collect::<Vec<_>>());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Turn a non-2xx response into [`UpstreamError::Status`], preferring the
    /// `message` field of a cluster Status body.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["message"].as_str().map(String::from))
            .unwrap_or(body);
        Err(UpstreamError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Upstream for ClusterClient {
    async fn snapshot(&self, path: &ResourcePath) -> Result<Value, UpstreamError> {
        let resp = self.request(&self.http, path).send().await?;
        let resp = Self::check_status(resp).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn watch(&self, path: &ResourcePath) -> Result<WatchStream, UpstreamError> {
        let resp = self
            .request(&self.watch_http, path)
            .query(&[("watch", "true")])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(ndjson_events(Box::pin(resp.bytes_stream())))
    }
}

/// Longest watch event line accepted before the watch is failed.
pub const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

/// Split a chunked byte stream into newline-delimited [`WatchEvent`]s.
///
/// Blank lines are skipped. A trailing line without a newline is decoded at
/// end of stream. The stream ends after the first transport error, or after
/// a line longer than [`MAX_EVENT_BYTES`].
pub fn ndjson_events<S, B, E>(body: S) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<UpstreamError> + Send,
{
    ndjson_events_limited(body, MAX_EVENT_BYTES)
}

fn ndjson_events_limited<S, B, E>(body: S, limit: usize) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<UpstreamError> + Send,
{
    let oversized = move || UpstreamError::Watch(format!("watch event exceeds {limit} bytes"));
    // `scanned` bytes of `buf` are known to hold no newline.
    futures::stream::unfold(
        (body, Vec::<u8>::new(), 0usize, false),
        move |(mut body, mut buf, mut scanned, mut eof)| async move {
            loop {
                if let Some(pos) = buf[scanned..].iter().position(|b| *b == b'\n') {
                    let end = scanned + pos;
                    scanned = 0;
                    if end > limit {
                        buf.clear();
                        return Some((Err(oversized()), (body, buf, 0, true)));
                    }
                    let line: Vec<u8> = buf.drain(..=end).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event =
                        serde_json::from_slice::<WatchEvent>(&line).map_err(UpstreamError::from);
                    return Some((event, (body, buf, scanned, eof)));
                }
                scanned = buf.len();
                if scanned > limit {
                    buf.clear();
                    return Some((Err(oversized()), (body, buf, 0, true)));
                }
                if eof {
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let line = std::mem::take(&mut buf);
                    let event =
                        serde_json::from_slice::<WatchEvent>(&line).map_err(UpstreamError::from);
                    return Some((event, (body, buf, 0, eof)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(e.into()), (body, buf, 0, true)));
                    }
                    None => eof = true,
                }
            }
        },
    )
    .boxed()
}
