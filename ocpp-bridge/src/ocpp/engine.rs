//! Protocol engine seams
//!
//! The bridge never talks to sockets directly. It sees the protocol engine through
//! two traits:
//! - [`SessionRegistry`]: resolve a station to its live session and send to it
//! - [`ChargePointHandler`]: lifecycle callbacks and inbound request dispatch,
//!   implemented by the bridge and registered with the engine
//!
//! Any engine honouring these contracts can carry the bridge; [`super::server`]
//! is the WebSocket implementation used in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::messages::{Call, CallResult, OcppError};
use super::types::{ChargePointRequest, ChargePointResponse};

/// A live charge point connection as seen by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub station_id: String,
    pub host: String,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(station_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            host: host.into(),
            connected_at: Utc::now(),
        }
    }
}

/// Read side of the engine's session registry plus the send primitives.
///
/// Sessions are re-resolved on every send; callers must not keep a [`Session`]
/// around between commands.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Look up the live session of a station, `None` when it is not connected
    async fn resolve(&self, station_id: &str) -> Option<Session>;

    /// Send a CALL and wait (bounded by the engine's request timeout) for the reply
    async fn send(&self, session: &Session, call: Call) -> Result<CallResult, OcppError>;

    /// Send a CALL without waiting for the reply
    async fn cast(&self, session: &Session, call: Call) -> Result<(), OcppError>;
}

/// Callbacks the engine invokes on the connection's own task
#[async_trait]
pub trait ChargePointHandler: Send + Sync {
    async fn on_connect(&self, session: &Session);

    async fn on_disconnect(&self, session: &Session);

    /// Handle a charge point initiated request and produce its acknowledgement
    async fn handle(
        &self,
        session: &Session,
        request: ChargePointRequest,
    ) -> Result<ChargePointResponse, OcppError>;
}
