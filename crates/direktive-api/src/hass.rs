//! Home Assistant WebSocket API client.
//!
//! Connects to `<base_url>/api/websocket`, authenticates with a long-lived
//! access token and keeps a supervisor task running that:
//!
//! - correlates `id`-tagged requests with their `result` replies,
//! - holds one `state_changed` subscription per connection and fans the
//!   events out to every local subscriber,
//! - reconnects with backoff after the socket drops and re-subscribes,
//!   then replays the current state of every entity to subscribers so
//!   changes made while disconnected are not missed.
//!
//! Requests issued while disconnected fail fast with
//! [`Error::SessionClosed`]; subscribers survive reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::error::Error;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

// ── Types ────────────────────────────────────────────────────────────

/// A state object as Home Assistant reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HassState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<HassState>,
    #[serde(default)]
    pub new_state: Option<HassState>,
    #[serde(default = "Utc::now")]
    pub time_fired: DateTime<Utc>,
}

/// Subset of `get_config` used for instance registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HassInstanceConfig {
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HassConnectConfig {
    pub base_url: Url,
    pub token: SecretString,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

/// `<base>/api/websocket` with the matching ws/wss scheme.
pub fn websocket_url(base_url: &Url) -> Result<Url, Error> {
    let mut url = base_url.clone();
    let scheme = match base_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::Protocol(format!(
                "unsupported Home Assistant URL scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Protocol(format!("cannot derive websocket URL from {base_url}")))?;
    url.set_path("/api/websocket");
    Ok(url)
}

// ── Client ───────────────────────────────────────────────────────────

enum Request {
    Call {
        payload: Map<String, Value>,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
    Subscribe {
        events: mpsc::UnboundedSender<StateChangedEvent>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the Home Assistant connection. Cheap to clone; the supervisor
/// stops when the last clone is dropped.
#[derive(Clone)]
pub struct HassClient {
    requests: mpsc::Sender<Request>,
    request_timeout: Duration,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for HassClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HassClient")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl HassClient {
    /// Connect and authenticate. Fails immediately on a rejected token;
    /// later disconnects are handled by the supervisor.
    pub async fn connect(config: HassConnectConfig) -> Result<Self, Error> {
        let first = open(&config).await?;

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let request_timeout = config.request_timeout;

        tokio::spawn(supervise(first, config, rx, cancel.clone()));

        Ok(Self {
            requests: tx,
            request_timeout,
            _guard: Arc::new(cancel.drop_guard()),
        })
    }

    async fn request(&self, payload: Map<String, Value>) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Call { payload, reply })
            .await
            .map_err(|_| Error::SessionClosed)?;

        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: self.request_timeout.as_secs(),
            })?
            .map_err(|_| Error::SessionClosed)?
    }

    pub async fn get_states(&self) -> Result<Vec<HassState>, Error> {
        let value = self.request(command("get_states")).await?;
        serde_json::from_value(value).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })
    }

    pub async fn get_config(&self) -> Result<HassInstanceConfig, Error> {
        let value = self.request(command("get_config")).await?;
        serde_json::from_value(value).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })
    }

    /// Invoke a service and wait for Home Assistant to finish executing it.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Map<String, Value>,
    ) -> Result<(), Error> {
        let mut payload = command("call_service");
        payload.insert("domain".into(), Value::String(domain.to_owned()));
        payload.insert("service".into(), Value::String(service.to_owned()));
        payload.insert("service_data".into(), Value::Object(data));
        payload.insert("target".into(), json!({ "entity_id": entity_id }));
        self.request(payload).await.map(|_| ())
    }

    /// Register a local listener for `state_changed` events.
    ///
    /// The returned receiver ends when the client shuts down. Delivery
    /// never blocks the socket reader.
    pub async fn subscribe_state_changes(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<StateChangedEvent>, Error> {
        let (events, rx) = mpsc::unbounded_channel();
        let (reply, ack) = oneshot::channel();
        self.requests
            .send(Request::Subscribe { events, reply })
            .await
            .map_err(|_| Error::SessionClosed)?;
        ack.await.map_err(|_| Error::SessionClosed)?;
        Ok(rx)
    }
}

fn command(kind: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("type".into(), Value::String(kind.to_owned()));
    payload
}

// ── Connection lifecycle ─────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

#[derive(Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<u64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<HassErrorBody>,
    #[serde(default)]
    event: Option<EventEnvelope>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct HassErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct EventEnvelope {
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default = "Utc::now")]
    time_fired: DateTime<Utc>,
}

/// Open the socket and run the auth handshake under the request timeout.
async fn open(config: &HassConnectConfig) -> Result<WsStream, Error> {
    let url = websocket_url(&config.base_url)?;
    tracing::info!(url = %url, "Connecting to Home Assistant");

    let handshake = async {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let first = next_json(&mut ws).await?;
        if first.kind != "auth_required" {
            return Err(Error::Protocol(format!(
                "expected auth_required, got {}",
                first.kind
            )));
        }

        let auth = json!({ "type": "auth", "access_token": config.token.expose_secret() });
        ws.send(Message::Text(auth.to_string().into()))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let reply = next_json(&mut ws).await?;
        match reply.kind.as_str() {
            "auth_ok" => Ok(ws),
            "auth_invalid" => Err(Error::HostAuthentication {
                message: reply.message.unwrap_or_else(|| "access token rejected".into()),
            }),
            other => Err(Error::Protocol(format!("unexpected auth reply {other}"))),
        }
    };

    let ws = tokio::time::timeout(config.request_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: config.request_timeout.as_secs(),
        })??;

    tracing::info!("Home Assistant connection authenticated");
    Ok(ws)
}

async fn next_json(ws: &mut WsStream) -> Result<Incoming, Error> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).map_err(|e| Error::Deserialization {
                    message: e.to_string(),
                    body: text.as_str().to_owned(),
                });
            }
            Some(Ok(Message::Close(_))) | None => return Err(Error::SessionClosed),
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

async fn supervise(
    first: WsStream,
    config: HassConnectConfig,
    mut requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    let mut subscribers: Vec<mpsc::UnboundedSender<StateChangedEvent>> = Vec::new();
    let mut stream = Some(first);
    let mut attempt: u32 = 0;

    loop {
        let (ws, replay) = if let Some(ws) = stream.take() {
            (ws, false)
        } else {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = open(&config) => result,
            };
            match result {
                Ok(ws) => {
                    attempt = 0;
                    (ws, true)
                }
                Err(e) if e.is_auth_failure() => {
                    tracing::error!(error = %e, "Home Assistant rejected the token, giving up");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Home Assistant connection failed");
                    if !config.reconnect.allows(attempt) {
                        tracing::error!("Home Assistant reconnection limit reached, giving up");
                        break;
                    }
                    let delay = config.reconnect.delay_for(attempt);
                    tracing::info!(
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        attempt,
                        "Waiting before Home Assistant reconnect"
                    );
                    if !wait_disconnected(delay, &mut requests, &mut subscribers, &cancel).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            }
        };

        match serve(ws, replay, &mut requests, &mut subscribers, &cancel).await {
            Ok(true) => break,
            Ok(false) => tracing::info!("Home Assistant connection closed, reconnecting"),
            Err(e) => tracing::warn!(error = %e, "Home Assistant connection lost, reconnecting"),
        }
    }

    tracing::debug!("Home Assistant supervisor exiting");
}

/// Sleep out a backoff delay while answering requests with `SessionClosed`.
/// Returns `false` when cancelled or when every client handle is gone.
async fn wait_disconnected(
    delay: Duration,
    requests: &mut mpsc::Receiver<Request>,
    subscribers: &mut Vec<mpsc::UnboundedSender<StateChangedEvent>>,
    cancel: &CancellationToken,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            () = &mut sleep => return true,
            req = requests.recv() => match req {
                None => return false,
                Some(Request::Call { reply, .. }) => {
                    let _ = reply.send(Err(Error::SessionClosed));
                }
                Some(Request::Subscribe { events, reply }) => {
                    subscribers.push(events);
                    let _ = reply.send(());
                }
            },
        }
    }
}

/// Ids of the requests the supervisor itself issues on a connection.
#[derive(Debug, Clone, Copy)]
struct OwnRequests {
    subscription: u64,
    replay: Option<u64>,
}

/// Serve one authenticated connection. `Ok(true)` means stop for good.
///
/// With `replay`, a `get_states` follows the subscription and its result is
/// fanned out as synthetic `state_changed` events.
async fn serve(
    ws: WsStream,
    replay: bool,
    requests: &mut mpsc::Receiver<Request>,
    subscribers: &mut Vec<mpsc::UnboundedSender<StateChangedEvent>>,
    cancel: &CancellationToken,
) -> Result<bool, Error> {
    let (mut write, mut read) = ws.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, Error>>> = HashMap::new();
    let mut next_id: u64 = 1;

    let subscription_id = next_id;
    next_id += 1;
    send(
        &mut write,
        &json!({ "id": subscription_id, "type": "subscribe_events", "event_type": "state_changed" }),
    )
    .await?;

    let replay_id = if replay {
        let id = next_id;
        next_id += 1;
        send(&mut write, &json!({ "id": id, "type": "get_states" })).await?;
        Some(id)
    } else {
        None
    };
    let own = OwnRequests {
        subscription: subscription_id,
        replay: replay_id,
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(true);
            }
            req = requests.recv() => match req {
                None => return Ok(true),
                Some(Request::Call { mut payload, reply }) => {
                    let id = next_id;
                    next_id += 1;
                    payload.insert("id".into(), Value::from(id));
                    if let Err(e) = send(&mut write, &Value::Object(payload)).await {
                        let _ = reply.send(Err(Error::SessionClosed));
                        return Err(e);
                    }
                    pending.insert(id, reply);
                }
                Some(Request::Subscribe { events, reply }) => {
                    subscribers.push(events);
                    let _ = reply.send(());
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&text, own, &mut pending, subscribers);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(false),
                Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send(write: &mut WsWrite, value: &Value) -> Result<(), Error> {
    write
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

fn dispatch(
    text: &str,
    own: OwnRequests,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, Error>>>,
    subscribers: &mut Vec<mpsc::UnboundedSender<StateChangedEvent>>,
) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable Home Assistant message");
            return;
        }
    };

    match (incoming.kind.as_str(), incoming.id) {
        ("result", Some(id)) if id == own.subscription => {
            if incoming.success != Some(true) {
                tracing::warn!("Home Assistant refused the state_changed subscription");
            }
        }
        ("result", Some(id)) if Some(id) == own.replay => {
            let states: Vec<HassState> = match incoming.result.map(serde_json::from_value) {
                Some(Ok(states)) if incoming.success == Some(true) => states,
                _ => {
                    tracing::warn!("Could not refresh states after reconnect");
                    return;
                }
            };
            tracing::debug!(count = states.len(), "Replaying states after reconnect");
            for state in states {
                let event = StateChangedEvent {
                    entity_id: state.entity_id.clone(),
                    old_state: None,
                    time_fired: state.last_updated.unwrap_or_else(Utc::now),
                    new_state: Some(state),
                };
                subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
        ("result", Some(id)) => {
            let Some(reply) = pending.remove(&id) else {
                return;
            };
            let outcome = if incoming.success == Some(true) {
                Ok(incoming.result.unwrap_or(Value::Null))
            } else {
                let body = incoming.error.unwrap_or(HassErrorBody {
                    code: "unknown_error".into(),
                    message: String::new(),
                });
                Err(Error::HostCommand {
                    code: body.code,
                    message: body.message,
                })
            };
            let _ = reply.send(outcome);
        }
        ("event", Some(id)) if id == own.subscription => {
            let Some(envelope) = incoming.event else {
                return;
            };
            if envelope.event_type != "state_changed" {
                return;
            }
            let mut event: StateChangedEvent = match serde_json::from_value(envelope.data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, "Malformed state_changed payload");
                    return;
                }
            };
            event.time_fired = envelope.time_fired;
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const OWN: OwnRequests = OwnRequests {
        subscription: 1,
        replay: Some(2),
    };

    #[test]
    fn websocket_url_from_http_base() {
        let url = websocket_url(&Url::parse("http://homeassistant.local:8123").unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://homeassistant.local:8123/api/websocket");
    }

    #[test]
    fn dispatch_routes_results_and_events() {
        let mut pending = HashMap::new();
        let (reply, mut rx) = oneshot::channel();
        pending.insert(7, reply);
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let mut subscribers = vec![events];

        dispatch(
            r#"{"id":7,"type":"result","success":false,"error":{"code":"not_found","message":"Service not found"}}"#,
            OWN,
            &mut pending,
            &mut subscribers,
        );
        match rx.try_recv().unwrap() {
            Err(Error::HostCommand { code, .. }) => assert_eq!(code, "not_found"),
            other => panic!("unexpected {other:?}"),
        }

        dispatch(
            r#"{"id":1,"type":"event","event":{"event_type":"state_changed","time_fired":"2025-01-01T00:00:00+00:00","data":{"entity_id":"light.kitchen","old_state":null,"new_state":{"entity_id":"light.kitchen","state":"on","attributes":{"brightness":200}}}}}"#,
            OWN,
            &mut pending,
            &mut subscribers,
        );
        let event = event_rx.try_recv().unwrap();
        assert_eq!(event.entity_id, "light.kitchen");
        assert_eq!(event.new_state.unwrap().state, "on");
        assert!(event.old_state.is_none());
    }

    #[test]
    fn replayed_states_become_events() {
        let mut pending = HashMap::new();
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let mut subscribers = vec![events];

        dispatch(
            r#"{"id":2,"type":"result","success":true,"result":[{"entity_id":"light.kitchen","state":"on","attributes":{},"last_updated":"2025-01-01T12:00:00+00:00"},{"entity_id":"sensor.battery","state":"80","attributes":{}}]}"#,
            OWN,
            &mut pending,
            &mut subscribers,
        );

        let first = event_rx.try_recv().unwrap();
        assert_eq!(first.entity_id, "light.kitchen");
        assert!(first.old_state.is_none());
        assert_eq!(first.time_fired.to_rfc3339(), "2025-01-01T12:00:00+00:00");
        assert_eq!(event_rx.try_recv().unwrap().new_state.unwrap().state, "80");
        assert!(event_rx.try_recv().is_err());
    }
}
