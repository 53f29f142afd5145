//! HTTP client construction for the Direktive.ai REST surface.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::Error;

const USER_AGENT: &str = concat!("direktive-bridge/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Which roots the cloud endpoint's certificate is checked against.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    #[default]
    System,
    /// Trust an extra PEM root, e.g. for a staging endpoint behind a private CA.
    CustomCa(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Applied to both connect and the whole request.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Client carrying `headers` on every request.
    pub fn build_client_with_headers(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        let builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let builder = if let TlsMode::CustomCa(path) = &self.tls {
            builder.add_root_certificate(load_root(path)?)
        } else {
            builder
        };

        builder
            .build()
            .map_err(|e| Error::Tls(format!("HTTP client setup: {e}")))
    }
}

fn load_root(path: &std::path::Path) -> Result<reqwest::Certificate, Error> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?;
    reqwest::Certificate::from_pem(&pem)
        .map_err(|e| Error::Tls(format!("{} is not a PEM certificate: {e}", path.display())))
}
