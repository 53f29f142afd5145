// ── Cloud connector seam ──

use async_trait::async_trait;
use direktive_api::{CloudEndpoint, CloudSession};

use crate::error::CoreError;

/// Opens authenticated cloud sessions. The production implementation is
/// [`WsConnector`]; tests plug in an in-process cloud.
#[async_trait]
pub trait CloudConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &CloudEndpoint) -> Result<CloudSession, CoreError>;
}

/// WebSocket connector over `direktive_api::session`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl CloudConnector for WsConnector {
    async fn connect(&self, endpoint: &CloudEndpoint) -> Result<CloudSession, CoreError> {
        direktive_api::session::connect(endpoint)
            .await
            .map_err(CoreError::from)
    }
}
