// direktive-api: wire protocol and transports for the Direktive.ai bridge
// (cloud sync socket, cloud REST, Home Assistant WebSocket API)

pub mod backoff;
pub mod crypto;
pub mod error;
pub mod hass;
pub mod protocol;
pub mod rest;
pub mod session;
pub mod transport;

pub use backoff::ReconnectConfig;
pub use crypto::PayloadCipher;
pub use error::Error;
pub use hass::{HassClient, HassConnectConfig, HassState, StateChangedEvent};
pub use protocol::{CloudMessage, ResumeMode, WireCommand, WireCommandResult, WireStateRecord};
pub use rest::CloudRestClient;
pub use session::{CloudEndpoint, CloudSession};
pub use transport::{TlsMode, TransportConfig};
