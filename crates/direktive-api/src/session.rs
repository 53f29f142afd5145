//! Cloud sync socket.
//!
//! [`connect`] performs one authenticated WebSocket upgrade against
//! `<api_url>/bridge` and spawns a pump task that encodes outgoing
//! [`CloudMessage`]s into frames and decodes incoming frames. The caller
//! sees a plain pair of channels ([`CloudSession`]); reconnection policy
//! lives with the caller.
//!
//! The session ends when either side goes away: the inbound receiver
//! yields `None` once the socket closes, and dropping the session cancels
//! the pump.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::crypto::PayloadCipher;
use crate::error::Error;
use crate::protocol::{CloudMessage, decode_frame, encode_frame};

const CHANNEL_CAPACITY: usize = 256;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const INSTANCE_ID_HEADER: &str = "x-instance-id";
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

// ── Endpoint ─────────────────────────────────────────────────────────

/// Everything needed to open one authenticated session.
#[derive(Debug, Clone)]
pub struct CloudEndpoint {
    pub socket_url: Url,
    pub instance_id: String,
    pub api_key: SecretString,
    pub session_token: Option<SecretString>,
    pub cipher: Option<PayloadCipher>,
    pub connect_timeout: Duration,
}

/// Derive the sync socket URL from the REST base URL.
///
/// `https://api.direktive.ai` becomes `wss://api.direktive.ai/bridge`.
pub fn bridge_socket_url(api_url: &Url) -> Result<Url, Error> {
    let mut url = api_url.clone();
    let scheme = match api_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::Protocol(format!(
                "unsupported cloud URL scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Protocol(format!("cannot derive socket URL from {api_url}")))?;
    url.path_segments_mut()
        .map_err(|()| Error::Protocol(format!("cannot derive socket URL from {api_url}")))?
        .pop_if_empty()
        .push("bridge");
    Ok(url)
}

// ── Session ──────────────────────────────────────────────────────────

/// A live duplex session with the cloud.
pub struct CloudSession {
    /// Messages to send. Closed once the socket is gone.
    pub outbound: mpsc::Sender<CloudMessage>,
    /// Messages received. Yields `None` when the socket is gone.
    pub inbound: mpsc::Receiver<CloudMessage>,
    _guard: Option<DropGuard>,
}

impl CloudSession {
    /// Wrap an existing channel pair, e.g. an in-process transport.
    pub fn from_channels(
        outbound: mpsc::Sender<CloudMessage>,
        inbound: mpsc::Receiver<CloudMessage>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            _guard: None,
        }
    }
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Open one session. HTTP 401/403 on the upgrade is reported as
/// [`Error::InvalidApiKey`]; anything else is a connect failure.
pub async fn connect(endpoint: &CloudEndpoint) -> Result<CloudSession, Error> {
    tracing::info!(url = %endpoint.socket_url, "Connecting to cloud");

    let uri: tungstenite::http::Uri = endpoint
        .socket_url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri)
        .with_header(API_KEY_HEADER, endpoint.api_key.expose_secret())
        .with_header(INSTANCE_ID_HEADER, endpoint.instance_id.as_str());
    if let Some(token) = &endpoint.session_token {
        request = request.with_header(SESSION_TOKEN_HEADER, token.expose_secret());
    }

    let connecting = tokio_tungstenite::connect_async(request);
    let (ws_stream, _response) = tokio::time::timeout(endpoint.connect_timeout, connecting)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: endpoint.connect_timeout.as_secs(),
        })?
        .map_err(map_upgrade_error)?;

    tracing::info!("Cloud session established");

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(pump(
        ws_stream,
        out_rx,
        in_tx,
        endpoint.cipher.clone(),
        cancel.clone(),
    ));

    Ok(CloudSession {
        outbound: out_tx,
        inbound: in_rx,
        _guard: Some(cancel.drop_guard()),
    })
}

fn map_upgrade_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                Error::InvalidApiKey {
                    message: format!("cloud refused the session (HTTP {status})"),
                }
            } else {
                Error::WebSocketConnect(format!("upgrade rejected with HTTP {status}"))
            }
        }
        other => Error::WebSocketConnect(other.to_string()),
    }
}

// ── Pump ─────────────────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    ws_stream: WsStream,
    mut out_rx: mpsc::Receiver<CloudMessage>,
    in_tx: mpsc::Sender<CloudMessage>,
    cipher: Option<PayloadCipher>,
    cancel: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                break;
            }
            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    break;
                };
                let text = match encode_frame(&message, cipher.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            kind = message.kind(),
                            "Failed to encode frame"
                        );
                        continue;
                    }
                };
                if let Err(e) = write.send(tungstenite::Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "Cloud socket write failed");
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let message = match decode_frame(&text, cipher.as_ref()) {
                            Ok(message) => message,
                            Err(e @ Error::Protocol(_)) => {
                                tracing::warn!(error = %e, "Dropping frame");
                                continue;
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Failed to decode frame");
                                continue;
                            }
                        };
                        if let CloudMessage::Ping { nonce } = message {
                            tracing::trace!(nonce, "Cloud ping");
                            let pong = encode_frame(&CloudMessage::Pong { nonce }, cipher.as_ref());
                            if let Ok(pong) = pong {
                                let _ = write.send(tungstenite::Message::Text(pong.into())).await;
                            }
                            continue;
                        }
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "Cloud closed the session"
                            );
                        } else {
                            tracing::info!("Cloud closed the session");
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Cloud socket read failed");
                        break;
                    }
                    None => {
                        tracing::info!("Cloud socket ended");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("Cloud session pump exiting");
}
