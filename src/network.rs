use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::aggregator::AggregatedChange;
use crate::change_log::Operation;
use crate::error::{Result, SyncError};
use crate::merge::ConflictStrategy;

/// Wire shape for one change, identical on upload and download per the
/// specification's external-interfaces section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChange {
    pub change_id: Option<i64>,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub timestamp: i64,
    pub version: i64,
    pub data: serde_json::Value,
}

impl From<&AggregatedChange> for WireChange {
    fn from(c: &AggregatedChange) -> Self {
        WireChange {
            change_id: None,
            table_name: c.table_name.clone(),
            record_id: c.record_id.clone(),
            operation: c.operation,
            timestamp: c.timestamp,
            version: c.version,
            data: serde_json::to_value(&c.data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A remote change as received from `download_changes`, already carrying
/// the server-assigned id used for `ProcessedChanges` idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub remote_id: String,
    #[serde(flatten)]
    pub change: WireChange,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    device_id: &'a str,
    user_id: &'a str,
    change_count: usize,
    batch_timestamp: i64,
    changes: &'a [WireChange],
}

#[derive(Debug, Deserialize)]
pub struct DownloadResponse {
    pub count: usize,
    pub timestamp: i64,
    pub sync_session_id: String,
    pub changes: Vec<RemoteChange>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictReportBody<'a> {
    table_name: &'a str,
    record_id: &'a str,
    client_data: &'a serde_json::Value,
    server_data: &'a serde_json::Value,
    resolution_strategy: &'a str,
    resolved_data: &'a serde_json::Value,
    metadata: ConflictMetadata<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictMetadata<'a> {
    device_id: &'a str,
    user_id: &'a str,
}

/// Push notification delivered over the long-lived channel: "a change
/// happened somewhere, you may want to download."
#[derive(Debug, Clone, Deserialize)]
pub struct PushNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub source_device_id: String,
    pub change_count: usize,
    pub timestamp: i64,
}

#[derive(Clone)]
struct Credentials {
    project_id: String,
    auth_token: String,
    device_id: String,
    user_id: String,
}

/// External-boundary facade speaking the wire protocol: per-call REST for
/// upload/download/conflict-report, and a long-lived WebSocket push
/// channel for remote-change notifications. REST failures return a
/// negative/error result to the caller and never tear down the push
/// channel.
pub struct NetworkClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    credentials: RwLock<Option<Credentials>>,
}

impl NetworkClient {
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            credentials: RwLock::new(None),
        }
    }

    pub async fn setup(&self, project_id: impl Into<String>, auth_token: impl Into<String>, device_id: impl Into<String>) {
        let mut guard = self.credentials.write().await;
        *guard = Some(Credentials {
            project_id: project_id.into(),
            auth_token: auth_token.into(),
            device_id: device_id.into(),
            user_id: String::new(),
        });
    }

    pub async fn set_user_id(&self, user_id: impl Into<String>) -> Result<()> {
        let mut guard = self.credentials.write().await;
        let creds = guard.as_mut().ok_or_else(|| SyncError::Initialization("network client not set up".into()))?;
        creds.user_id = user_id.into();
        Ok(())
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let guard = self.credentials.read().await;
        let creds = guard
            .as_ref()
            .ok_or_else(|| SyncError::Initialization("missing device or user id".into()))?;
        if creds.device_id.is_empty() || creds.user_id.is_empty() {
            return Err(SyncError::Initialization("missing device or user id".into()));
        }
        let mut headers = HeaderMap::new();
        let auth_value = if creds.auth_token.starts_with("Bearer ") || creds.auth_token.starts_with("Api-Key ") {
            creds.auth_token.clone()
        } else {
            format!("Bearer {}", creds.auth_token)
        };
        headers.insert(reqwest::header::AUTHORIZATION, HeaderValue::from_str(&auth_value).map_err(|e| SyncError::network(e.to_string()))?);
        headers.insert(HeaderName::from_static("x-project-id"), HeaderValue::from_str(&creds.project_id).map_err(|e| SyncError::network(e.to_string()))?);
        headers.insert(HeaderName::from_static("x-device-id"), HeaderValue::from_str(&creds.device_id).map_err(|e| SyncError::network(e.to_string()))?);
        headers.insert(HeaderName::from_static("x-user-id"), HeaderValue::from_str(&creds.user_id).map_err(|e| SyncError::network(e.to_string()))?);
        headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Transmits one batch. Individual REST failures (including timeouts)
    /// return `Ok(false)` to the caller rather than propagating, so the
    /// worker can simply retry on the next cycle; only header/setup errors
    /// propagate as `Err`.
    pub async fn upload_changes(&self, changes: &[WireChange]) -> Result<bool> {
        let headers = self.headers().await?;
        let device_id = {
            let guard = self.credentials.read().await;
            guard.as_ref().unwrap().device_id.clone()
        };
        let user_id = {
            let guard = self.credentials.read().await;
            guard.as_ref().unwrap().user_id.clone()
        };
        let body = UploadRequest {
            device_id: &device_id,
            user_id: &user_id,
            change_count: changes.len(),
            batch_timestamp: chrono::Utc::now().timestamp_millis(),
            changes,
        };

        let response = self
            .http
            .post(format!("{}/sync/upload", self.base_url))
            .headers(headers)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "upload rejected by server");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "upload request failed");
                Ok(false)
            }
        }
    }

    pub async fn download_changes(&self, since: i64) -> Result<DownloadResponse> {
        let headers = self.headers().await?;
        let response = self
            .http
            .get(format!("{}/sync/download", self.base_url))
            .query(&[("since", since.to_string())])
            .headers(headers)
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::network_status(response.status().as_u16(), "download failed"));
        }
        response.json().await.map_err(|e| SyncError::network(e.to_string()))
    }

    /// Fire-and-forget telemetry; failures are logged and swallowed.
    pub async fn report_conflict(
        &self,
        strategy: ConflictStrategy,
        table_name: &str,
        record_id: &str,
        client_data: &serde_json::Value,
        server_data: &serde_json::Value,
        resolved_data: &serde_json::Value,
        sync_session_id: &str,
    ) {
        let Ok(headers) = self.headers().await else { return };
        let (device_id, user_id) = {
            let guard = self.credentials.read().await;
            match guard.as_ref() {
                Some(c) => (c.device_id.clone(), c.user_id.clone()),
                None => return,
            }
        };
        let body = ConflictReportBody {
            table_name,
            record_id,
            client_data,
            server_data,
            resolution_strategy: strategy.as_str(),
            resolved_data,
            metadata: ConflictMetadata { device_id: &device_id, user_id: &user_id },
        };
        let result = self
            .http
            .post(format!("{}/sync/conflict", self.base_url))
            .query(&[("syncSessionId", sync_session_id)])
            .headers(headers)
            .json(&body)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "conflict telemetry report failed");
        }
    }

    /// Opens the long-lived push channel and forwards parsed
    /// notifications into the returned receiver. Reconnects forever on
    /// disconnect, resubscribing with the last-seen timestamp; the
    /// returned receiver stays open across reconnects.
    pub fn listen_for_remote_changes(self: &Arc<Self>) -> mpsc::UnboundedReceiver<PushNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            let mut last_seen: i64 = 0;
            loop {
                match client.run_push_channel_once(last_seen, &tx).await {
                    Ok(newest) => last_seen = newest,
                    Err(e) => tracing::warn!(error = %e, "push channel disconnected, reconnecting"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        rx
    }

    async fn run_push_channel_once(&self, since: i64, tx: &mpsc::UnboundedSender<PushNotification>) -> Result<i64> {
        let url = format!("{}?since={}", self.ws_url, since);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        // Ping keeps intermediaries from closing an idle connection.
        let _ = write.send(WsMessage::Ping(Vec::new())).await;

        let mut newest = since;
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    if let Ok(note) = serde_json::from_str::<PushNotification>(&text) {
                        newest = newest.max(note.timestamp);
                        if tx.send(note).is_err() {
                            break;
                        }
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(SyncError::network(e.to_string())),
            }
        }
        Ok(newest)
    }

    /// Closes any outstanding connection-level state. With a
    /// reconnect-loop push channel there is no persistent handle to
    /// close here; kept for interface symmetry with `reconnect`.
    pub async fn disconnect(&self) {
        tracing::debug!("network client disconnect requested");
    }

    pub fn reconnect(self: &Arc<Self>, _last_synced_at: Option<i64>) -> mpsc::UnboundedReceiver<PushNotification> {
        self.listen_for_remote_changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn headers_require_device_and_user_id() {
        let client = NetworkClient::new("http://localhost", "ws://localhost");
        client.setup("proj", "token", "device-1").await;
        let err = client.headers().await.unwrap_err();
        assert!(matches!(err, SyncError::Initialization(_)));
        client.set_user_id("user-1").await.unwrap();
        assert!(client.headers().await.is_ok());
    }

    #[tokio::test]
    async fn auth_header_preserves_explicit_scheme() {
        let client = NetworkClient::new("http://localhost", "ws://localhost");
        client.setup("proj", "Api-Key abc", "device-1").await;
        client.set_user_id("user-1").await.unwrap();
        let headers = client.headers().await.unwrap();
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Api-Key abc");
    }
}
