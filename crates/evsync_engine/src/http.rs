//! HTTP event API implementation.
//!
//! This module provides an HTTP-based [`EventApi`]. The actual HTTP client is
//! abstracted via a trait so the engine does not depend on any particular HTTP
//! stack; certificate pinning, DNS fallback and token refresh belong to the
//! client implementation.

use crate::api::EventApi;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use evsync_protocol::{
    ErrorBody, EventBatch, EventId, LatestEventResponse, ProtocolError, SyncStreamId,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a new response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// the request never produced a response (connection refused, DNS failure,
/// reset) and is treated as a retryable transport error.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    async fn get(&self, url: &str) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// Returns the path of a stream's event resource, without the trailing
/// `/latest` or `/{since}` segment.
pub fn stream_path(stream: &SyncStreamId) -> String {
    match stream {
        SyncStreamId::Core { .. } => "/core/v4/events".to_string(),
        SyncStreamId::Calendar {
            calendar_id,
            api_version,
            ..
        } => format!(
            "/calendar/v{}/{}/events",
            api_version,
            encode_segment(calendar_id.as_str())
        ),
        SyncStreamId::Drive { share_id, .. } => {
            format!("/drive/shares/{}/events", encode_segment(share_id.as_str()))
        }
    }
}

/// Percent-encodes one URL path segment.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// HTTP-based event API.
///
/// Uses CBOR encoding for response bodies.
pub struct HttpEventApi<C: HttpClient> {
    /// Base URL of the API (e.g., "https://api.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpEventApi<C> {
    /// Creates a new HTTP event API.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the API may be used.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Closes the API; every later call fails with [`SyncError::NotConnected`].
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    async fn get_cbor<T, F>(&self, path: &str, decode: F) -> SyncResult<T>
    where
        F: FnOnce(&[u8]) -> Result<T, ProtocolError>,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).await.map_err(|e| {
            self.set_error(&e);
            SyncError::transport_retryable(e)
        })?;

        if !response.is_success() {
            let err = error_from_response(&response);
            self.set_error(&err.to_string());
            debug!(url = %url, status = response.status, error = %err, "event api request failed");
            return Err(err);
        }

        self.clear_error();
        decode(&response.body).map_err(SyncError::from)
    }
}

fn error_from_response(response: &HttpResponse) -> SyncError {
    match ErrorBody::decode(&response.body) {
        Ok(body) if body.invalidates_checkpoint() => SyncError::CheckpointInvalid,
        Ok(body) => SyncError::Api {
            status: response.status,
            code: body.code,
            message: body.error,
        },
        Err(_) => SyncError::Api {
            status: response.status,
            code: 0,
            message: format!("http status {}", response.status),
        },
    }
}

#[async_trait]
impl<C: HttpClient> EventApi for HttpEventApi<C> {
    async fn latest_event_id(&self, stream: &SyncStreamId) -> SyncResult<EventId> {
        let path = format!("{}/latest", stream_path(stream));
        let response = self.get_cbor(&path, LatestEventResponse::decode).await?;
        Ok(response.event_id)
    }

    async fn events(&self, stream: &SyncStreamId, since: &EventId) -> SyncResult<EventBatch> {
        let path = format!("{}/{}", stream_path(stream), encode_segment(since.as_str()));
        let batch = self.get_cbor(&path, EventBatch::decode).await?;
        if batch.refresh {
            return Err(SyncError::CheckpointInvalid);
        }
        Ok(batch)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a GET request for `path` and returns the response.
    fn handle_get(&self, path: &str) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for std::sync::Arc<S> {
    fn handle_get(&self, path: &str) -> HttpResponse {
        (**self).handle_get(path)
    }
}

/// A loopback HTTP client that routes requests directly to an in-process
/// server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.healthy.store(reachable, Ordering::SeqCst);
    }

    /// Returns the underlying server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    async fn get(&self, url: &str) -> Result<HttpResponse, String> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }

        // Strip scheme and authority
        let path = url
            .find("://")
            .and_then(|i| url[i + 3..].find('/').map(|j| &url[i + 3 + j..]))
            .unwrap_or(url);

        Ok(self.server.handle_get(path))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
