//! Ops-protocol WebSocket RPC client
//!
//! Wraps the relay WebSocket as request/response RPC. Requests are
//! correlated by requestId; `ops_response` resolves, `ops_error` rejects,
//! and session lifecycle events are forwarded asynchronously to the session
//! manager for bookkeeping.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{BrokerError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// JSON envelope shared by all ops-protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpsEnvelope {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OpsError>,
}

/// Error payload of an `ops_error` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsError {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl OpsError {
    fn into_broker_error(self) -> BrokerError {
        let message = self.message.unwrap_or_else(|| self.code.clone());
        match self.code.as_str() {
            "invalid_session" => BrokerError::InvalidSession(message),
            "not_owner" => {
                BrokerError::InvalidInput(format!("lease is held by another client: {message}"))
            }
            "timeout" => BrokerError::Timeout(0),
            "relay_unavailable" => BrokerError::RelayUnavailable(message),
            _ => BrokerError::Driver(message),
        }
    }
}

/// Lifecycle notifications broadcast by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsEventKind {
    SessionClosed,
    SessionExpired,
    TabClosed,
}

#[derive(Debug, Clone)]
pub struct OpsEvent {
    pub kind: OpsEventKind,
    pub ops_session_id: Option<String>,
    pub payload: Option<Value>,
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<Result<Value>>>>;

/// Request/response client over one relay WebSocket connection.
pub struct OpsClient {
    sink: Mutex<WsSink>,
    pending: PendingMap,
    client_id: String,
    reader_task: JoinHandle<()>,
}

impl OpsClient {
    /// Connect and start the read pump. Lifecycle events flow out through
    /// the returned receiver.
    pub async fn connect(url: &Url) -> Result<(Self, mpsc::UnboundedReceiver<OpsEvent>)> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(ref response)
                    if response.status().as_u16() == 401 =>
                {
                    BrokerError::RelayUnauthorized
                }
                other => BrokerError::RelayUnavailable(other.to_string()),
            })?;
        let (sink, source) = stream.split();

        let pending: PendingMap = Arc::new(DashMap::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_pump(source, Arc::clone(&pending), event_tx));

        let client = Self {
            sink: Mutex::new(sink),
            pending,
            client_id: format!("client-{}", &Uuid::new_v4().simple().to_string()[..8]),
            reader_task,
        };
        Ok((client, event_rx))
    }

    /// Send one command and await the correlated response.
    pub async fn request(
        &self,
        command: &str,
        payload: Option<Value>,
        ops_session_id: Option<&str>,
        timeout_ms: u64,
        lease_id: Option<&str>,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().simple().to_string();
        let envelope = OpsEnvelope {
            r#type: "ops_request".to_string(),
            request_id: Some(request_id.clone()),
            client_id: Some(self.client_id.clone()),
            ops_session_id: ops_session_id.map(|s| s.to_string()),
            lease_id: lease_id.map(|s| s.to_string()),
            command: Some(command.to_string()),
            payload,
            ..Default::default()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let body = serde_json::to_string(&envelope)
            .map_err(|e| BrokerError::InvalidInput(format!("unserializable payload: {e}")))?;
        trace!(command, request_id, "sending ops request");
        if let Err(e) = self.sink.lock().await.send(Message::Text(body)).await {
            self.pending.remove(&request_id);
            return Err(BrokerError::RelayUnavailable(e.to_string()));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::RelayUnavailable("relay connection lost".to_string())),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(BrokerError::Timeout(timeout_ms))
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Tear down the read pump and reject anything still pending.
    pub async fn close(&self) {
        self.reader_task.abort();
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(BrokerError::RelayUnavailable(
                    "relay connection closed".to_string(),
                )));
            }
        }
    }
}

impl Drop for OpsClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_pump(
    mut source: WsSource,
    pending: PendingMap,
    event_tx: mpsc::UnboundedSender<OpsEvent>,
) {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let envelope: OpsEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "discarding unparsable relay message");
                continue;
            }
        };
        dispatch(envelope, &pending, &event_tx);
    }
    debug!("relay read pump finished");

    // Connection gone: everything pending is now unanswerable.
    let keys: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx
                .send(Err(BrokerError::RelayUnavailable("relay connection closed".to_string())));
        }
    }
}

fn dispatch(envelope: OpsEnvelope, pending: &PendingMap, event_tx: &mpsc::UnboundedSender<OpsEvent>) {
    match envelope.r#type.as_str() {
        "ops_response" => {
            if let Some(request_id) = &envelope.request_id
                && let Some((_, tx)) = pending.remove(request_id)
            {
                let _ = tx.send(Ok(envelope.payload.unwrap_or(Value::Null)));
            }
        }
        "ops_error" => {
            if let Some(request_id) = &envelope.request_id
                && let Some((_, tx)) = pending.remove(request_id)
            {
                let error = envelope
                    .error
                    .map(OpsError::into_broker_error)
                    .unwrap_or_else(|| BrokerError::Driver("relay error".to_string()));
                let _ = tx.send(Err(error));
            }
        }
        "ops_event" => {
            let kind = match envelope.event.as_deref() {
                Some("ops_session_closed") => Some(OpsEventKind::SessionClosed),
                Some("ops_session_expired") => Some(OpsEventKind::SessionExpired),
                Some("ops_tab_closed") => Some(OpsEventKind::TabClosed),
                other => {
                    trace!(event = ?other, "ignoring unknown relay event");
                    None
                }
            };
            if let Some(kind) = kind {
                let _ = event_tx.send(OpsEvent {
                    kind,
                    ops_session_id: envelope.ops_session_id,
                    payload: envelope.payload,
                });
            }
        }
        other => trace!(r#type = other, "ignoring relay message type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_broker_kinds() {
        let err = OpsError { code: "invalid_session".to_string(), message: None }
            .into_broker_error();
        assert_eq!(err.kind(), "invalid_session");

        let err = OpsError { code: "not_owner".to_string(), message: Some("lease x".into()) }
            .into_broker_error();
        assert_eq!(err.kind(), "invalid_input");

        let err =
            OpsError { code: "relay_unavailable".to_string(), message: None }.into_broker_error();
        assert_eq!(err.kind(), "relay_unavailable");
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = OpsEnvelope {
            r#type: "ops_request".to_string(),
            request_id: Some("r1".to_string()),
            command: Some("listTabs".to_string()),
            ..Default::default()
        };
        let text = serde_json::to_string(&envelope).expect("envelope serializes");
        assert!(text.contains("\"requestId\":\"r1\""));
        let back: OpsEnvelope = serde_json::from_str(&text).expect("envelope parses");
        assert_eq!(back.command.as_deref(), Some("listTabs"));
    }
}
