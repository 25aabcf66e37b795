//! Polling REST feed.
//!
//! Hosted realtime databases expose every path as `GET {base}/{path}.json`.
//! [`HttpPollFeed`] polls the channel path at a fixed interval and emits the
//! full document each time; the store's idempotent insert turns repeated
//! snapshots into no-ops. Range queries use the REST filter parameters
//! `orderBy="timestamp"&startAt=..&endAt=..`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FeedSource, FeedSubscription, RawSnapshot};
use crate::error::TransportError;
use crate::reading::ChannelId;

/// Default HTTP timeout for one poll.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling feed over a REST endpoint.
#[derive(Debug, Clone)]
pub struct HttpPollFeed {
    client: reqwest::Client,
    base_url: reqwest::Url,
    poll_interval: Duration,
    auth_token: Option<String>,
    description: String,
}

impl HttpPollFeed {
    /// Creates a feed polling `base_url` every `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if `base_url` is not an
    /// absolute URL that can carry a path, and [`TransportError::Http`] if
    /// the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Result<Self, TransportError> {
        let raw = base_url.into();
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: raw.clone(),
            reason,
        };
        let base_url = reqwest::Url::parse(raw.trim_end_matches('/')).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("cannot hold a path".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|source| TransportError::Http { source })?;

        Ok(Self {
            client,
            description: format!("http-poll: {}", base_url.as_str().trim_end_matches('/')),
            base_url,
            poll_interval: poll_interval.max(Duration::from_millis(100)),
            auth_token: None,
        })
    }

    /// Appends `auth=<token>` to every request.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// `{base}/{channel}.json`, with the channel name percent-encoded as a
    /// single path segment.
    fn channel_url(&self, channel: &ChannelId) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&format!("{channel}.json"));
        }
        url
    }

    async fn fetch(&self, url: &reqwest::Url, query: &[(&str, String)]) -> Result<RawSnapshot, TransportError> {
        let mut request = self.client.get(url.clone()).query(query);
        if let Some(token) = &self.auth_token {
            request = request.query(&[("auth", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Http { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Http { source })?;
        RawSnapshot::from_slice(&body)
    }
}

#[async_trait]
impl FeedSource for HttpPollFeed {
    async fn subscribe(&self, channel: &ChannelId) -> Result<FeedSubscription, TransportError> {
        let url = self.channel_url(channel);
        // Fail fast so the caller sees connection errors as connect errors.
        let first = self.fetch(&url, &[]).await.map_err(|e| TransportError::Connect {
            endpoint: url.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(first));

        let feed = self.clone();
        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(feed.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let item = feed.fetch(&url, &[]).await;
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });

        Ok(FeedSubscription::with_producer(rx, producer))
    }

    async fn fetch_range(
        &self,
        channel: &ChannelId,
        from: u64,
        to: u64,
    ) -> Result<Option<RawSnapshot>, TransportError> {
        let url = self.channel_url(channel);
        let query = [
            ("orderBy", "\"timestamp\"".to_string()),
            ("startAt", from.to_string()),
            ("endAt", to.to_string()),
        ];
        self.fetch(&url, &query).await.map(Some)
    }

    fn description(&self) -> &str {
        &self.description
    }
}
