//! Remote command dispatch
//!
//! Resolves the target session, encodes the command through the
//! [`CommandKind`] table, sends it and decodes the charge point's reply.
//! The session is resolved before anything else, so an unknown station is
//! reported as such whatever the command looks like.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::{CommandError, CommandKind, RemoteCommandRequest, RemoteCommandResponse};
use crate::ocpp::{Call, SessionRegistry};

/// Detail string of a successfully dispatched command
pub const DISPATCH_OK: &str = "OK";

pub struct Dispatcher {
    registry: Arc<dyn SessionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send a command and wait for the charge point's reply
    pub async fn dispatch(&self, req: &RemoteCommandRequest) -> Result<RemoteCommandResponse, CommandError> {
        let session = self
            .registry
            .resolve(&req.cp_id)
            .await
            .ok_or_else(|| CommandError::StationNotConnected(req.cp_id.clone()))?;

        let kind: CommandKind = req.command.parse()?;
        let call = kind.to_call(&req.data)?;
        info!(station = %req.cp_id, command = %kind, message_id = %call.message_id, "Dispatching command");

        let result = self.registry.send(&session, call).await.map_err(|e| {
            error!(station = %req.cp_id, command = %kind, "Command failed: {}", e);
            CommandError::Dispatch(e)
        })?;

        let data = kind.parse_reply(&result).map_err(|e| {
            error!(station = %req.cp_id, command = %kind, "Unexpected reply: {}", e);
            e
        })?;

        Ok(RemoteCommandResponse {
            detail: DISPATCH_OK.to_string(),
            data,
        })
    }

    /// Send a prepared call without waiting for the reply
    pub async fn forward(&self, cp_id: &str, call: Call) -> Result<(), CommandError> {
        let session = self
            .registry
            .resolve(cp_id)
            .await
            .ok_or_else(|| CommandError::StationNotConnected(cp_id.to_string()))?;

        let action = call.action;
        self.registry.cast(&session, call).await.map_err(|e| {
            warn!(station = %cp_id, action = %action, "Forward failed: {}", e);
            CommandError::Dispatch(e)
        })?;

        info!(station = %cp_id, action = %action, "Forwarded queued command");
        Ok(())
    }
}
