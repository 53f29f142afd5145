// Async HTTP client for the Direktive.ai REST endpoints.
//
// Auth: x-api-key header on every request.
// Endpoints: GET /health, GET /subscription, POST /bridge/register

use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::Error;
use crate::session::{API_KEY_HEADER, INSTANCE_ID_HEADER};
use crate::transport::TransportConfig;

// ── Response shapes ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Subscription {
    #[serde(default = "default_plan")]
    pub plan: String,
    /// Whether the plan requires sealed frames.
    #[serde(default)]
    pub encryption_required: bool,
}

fn default_plan() -> String {
    "basic".into()
}

/// Body of the one-time instance registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub instance_id: String,
    pub ha_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// REST client for the cloud's setup and status endpoints.
pub struct CloudRestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl CloudRestClient {
    /// Build with `x-api-key` and `x-instance-id` injected as default headers.
    pub fn new(
        base_url: &Url,
        api_key: &SecretString,
        instance_id: &str,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut key_value =
            HeaderValue::from_str(api_key.expose_secret()).map_err(|e| Error::InvalidApiKey {
                message: format!("invalid API key header value: {e}"),
            })?;
        key_value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key_value);
        if let Ok(id) = HeaderValue::from_str(instance_id) {
            headers.insert(INSTANCE_ID_HEADER, id);
        }

        let http = transport.build_client_with_headers(headers)?;

        let mut base_url = base_url.clone();
        let path = base_url.path().trim_end_matches('/').to_owned();
        base_url.set_path(&format!("{path}/"));

        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn health(&self) -> Result<HealthStatus, Error> {
        let url = self.url("health")?;
        debug!("GET {url}");
        let resp = self.http.get(url).send().await?;
        handle_response(resp).await
    }

    pub async fn subscription(&self) -> Result<Subscription, Error> {
        let url = self.url("subscription")?;
        debug!("GET {url}");
        let resp = self.http.get(url).send().await?;
        handle_response(resp).await
    }

    pub async fn register(&self, registration: &Registration) -> Result<(), Error> {
        let url = self.url("bridge/register")?;
        debug!("POST {url}");
        let resp = self.http.post(url).json(registration).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(parse_error(status, resp).await)
        }
    }
}

async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    } else {
        Err(parse_error(status, resp).await)
    }
}

async fn parse_error(status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
    let raw = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&raw)
        .ok()
        .and_then(|e| e.message.or(e.error))
        .unwrap_or_else(|| {
            if raw.is_empty() {
                status.to_string()
            } else {
                raw
            }
        });

    if matches!(status.as_u16(), 401 | 403) {
        return Error::InvalidApiKey { message };
    }
    Error::CloudApi {
        status: status.as_u16(),
        message,
    }
}
