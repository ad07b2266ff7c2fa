//! HTTP client for remote wall displays.
//!
//! Talks to the wall API: lists and mutates photos, and follows the change
//! stream over Server-Sent Events with automatic reconnects. Combined with
//! [`ViewSynchronizer`](crate::sync::ViewSynchronizer) it keeps a display in
//! step with the wall from another machine.

use crate::api::{ClearResponse, DeleteResponse, PhotoListResponse, PhotoResponse};
use crate::feed::ChangeEvent;
use crate::photo::{PhotoId, PhotoRecord};
use crate::sync::PhotoSource;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<Option<ChangeEvent>, ClientError>> + Send>>;

/// Client for a remote wall
#[derive(Debug, Clone)]
pub struct WallClient {
    http: reqwest::Client,
    base_url: String,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
}

impl WallClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
        }
    }

    /// Backoff bounds for event stream reconnects
    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            Err(ClientError::Http { status, message })
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        response
            .json()
            .await
            .map_err(|e| ClientError::Deserialization(e.to_string()))
    }

    /// All photos, newest first
    pub async fn list(&self) -> Result<Vec<PhotoResponse>, ClientError> {
        let response = self.send(self.http.get(self.url("/api/photos"))).await?;
        let list: PhotoListResponse = Self::json(response).await?;
        Ok(list.photos)
    }

    pub async fn get(&self, id: PhotoId) -> Result<Option<PhotoResponse>, ClientError> {
        match self.send(self.http.get(self.url(&format!("/api/photos/{id}")))).await {
            Ok(response) => Self::json(response).await.map(Some),
            Err(ClientError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upload a photo
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        content_type: &str,
        filename: &str,
        uploader: Option<&str>,
    ) -> Result<PhotoResponse, ClientError> {
        let mut query = vec![("filename", filename)];
        if let Some(uploader) = uploader {
            query.push(("uploader", uploader));
        }

        let request = self
            .http
            .post(self.url("/api/photos"))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data.into());
        Self::json(self.send(request).await?).await
    }

    /// Delete a photo. `false` if it was already gone.
    pub async fn delete(&self, id: PhotoId) -> Result<bool, ClientError> {
        let response = self
            .send(self.http.delete(self.url(&format!("/api/photos/{id}"))))
            .await?;
        let body: DeleteResponse = Self::json(response).await?;
        Ok(body.deleted)
    }

    /// Remove every photo
    pub async fn clear(&self) -> Result<u64, ClientError> {
        let response = self.send(self.http.delete(self.url("/api/photos"))).await?;
        let body: ClearResponse = Self::json(response).await?;
        Ok(body.removed)
    }

    /// Follow the wall's change stream.
    ///
    /// Reconnects with exponential backoff when the connection drops, and
    /// yields [`ChangeEvent::Resync`] after every reconnect since events may
    /// have been missed meanwhile. The background task stops once the
    /// returned stream is dropped.
    pub fn events(&self) -> ReceiverStream<ChangeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.clone();
        tokio::spawn(async move { client.pump_events(tx).await });
        ReceiverStream::new(rx)
    }

    async fn pump_events(self, tx: mpsc::Sender<ChangeEvent>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.reconnect_base_delay,
            max_interval: self.reconnect_max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut missed_events = false;

        loop {
            match self.open_event_stream().await {
                Ok(mut frames) => {
                    info!(base_url = %self.base_url, "Connected to change stream");
                    backoff.reset();
                    if missed_events && tx.send(ChangeEvent::Resync).await.is_err() {
                        return;
                    }

                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(Some(event)) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            // Keep-alive
                            Ok(None) => {
                                if tx.is_closed() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Change stream error");
                                break;
                            }
                        }
                    }
                    debug!("Change stream ended");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to change stream");
                }
            }

            missed_events = true;
            if tx.is_closed() {
                return;
            }
            let delay = backoff
                .next_backoff()
                .unwrap_or(self.reconnect_max_delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_event_stream(&self) -> Result<FrameStream, ClientError> {
        let response = self
            .send(
                self.http
                    .get(self.url("/api/events"))
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .await?;
        Ok(frames_from_response(response))
    }
}

#[async_trait]
impl PhotoSource for WallClient {
    type Error = ClientError;

    async fn list(&self) -> Result<Vec<PhotoRecord>, ClientError> {
        Ok(WallClient::list(self)
            .await?
            .into_iter()
            .map(|photo| photo.record)
            .collect())
    }
}

/// Parse SSE frames line by line. Yields `Ok(None)` for keep-alive comments.
fn frames_from_response(response: reqwest::Response) -> FrameStream {
    let bytes = response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let lines = tokio::io::BufReader::new(StreamReader::new(bytes)).lines();

    let stream = futures::stream::unfold(
        (lines, FrameBuffer::default()),
        |(mut lines, mut frame)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            if let Some(data) = frame.take() {
                                return Some((parse_event(&data).map(Some), (lines, frame)));
                            }
                            continue;
                        }
                        if line.starts_with(':') {
                            return Some((Ok(None), (lines, frame)));
                        }
                        if let Some(value) = line.strip_prefix("data:") {
                            frame.data.push(value.trim_start().to_string());
                        }
                        // event:, id: and retry: carry nothing the payload lacks
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((
                            Err(ClientError::Connection(format!("SSE stream error: {e}"))),
                            (lines, frame),
                        ));
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

#[derive(Default)]
struct FrameBuffer {
    data: Vec<String>,
}

impl FrameBuffer {
    fn take(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

fn parse_event(data: &str) -> Result<ChangeEvent, ClientError> {
    serde_json::from_str(data)
        .map_err(|e| ClientError::Deserialization(format!("failed to parse change event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let event = parse_event(r#"{"type":"cleared"}"#).unwrap();
        assert_eq!(event, ChangeEvent::Cleared);
        assert!(parse_event("{}").is_err());
    }

    #[test]
    fn test_frame_buffer_joins_multiline_data() {
        let mut frame = FrameBuffer::default();
        assert!(frame.take().is_none());

        frame.data.push(r#"{"type":"#.to_string());
        frame.data.push(r#""resync"}"#.to_string());
        let data = frame.take().unwrap();
        assert_eq!(parse_event(&data).unwrap(), ChangeEvent::Resync);
        assert!(frame.take().is_none());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = WallClient::new("http://wall.local:8080/");
        assert_eq!(client.base_url(), "http://wall.local:8080");
        assert_eq!(client.url("/api/photos"), "http://wall.local:8080/api/photos");
    }
}
