//! Remote commands issued by the backend
//!
//! Every [`CommandKind`] owns exactly one request/reply pair, described by a
//! [`RemoteCommand`] implementation. [`CommandKind::to_call`] and
//! [`CommandKind::parse_reply`] form the dispatch table: an exhaustive match, so a
//! new kind does not compile until its pair exists.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ocpp::{
    Action, Call, CallResult, ChangeConfigurationRequest, ChangeConfigurationResponse,
    GetConfigurationRequest, GetConfigurationResponse, OcppError, OcppMessage,
    RemoteStartTransactionRequest, RemoteStartTransactionResponse, RemoteStopTransactionRequest,
    RemoteStopTransactionResponse,
};

/// Backend request body of `POST /command/`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandRequest {
    #[serde(default)]
    pub cp_id: String,
    #[serde(default)]
    pub command: String,
    /// Command specific parameters, decoded once the command kind is known
    #[serde(default)]
    pub data: Value,
}

/// Successful outcome of a dispatched command.
///
/// The charge point reply is flattened next to `detail`, so a remote start answers
/// `{"detail": "...", "status": "Accepted"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandResponse {
    pub detail: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Error body returned to backend callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Errors on the backend command path
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("Charger {0} not connected")]
    StationNotConnected(String),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("Invalid command data: {0}")]
    InvalidPayload(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] OcppError),
}

impl CommandError {
    /// Stable detail string exposed to backend callers
    pub fn detail(&self) -> &'static str {
        match self {
            CommandError::Validation(reason) => *reason,
            CommandError::StationNotConnected(_) => "Charger not connected",
            CommandError::UnsupportedCommand(_) => "Invalid command",
            CommandError::InvalidPayload(_) => "Invalid command data",
            CommandError::Dispatch(_) => "Internal server error",
        }
    }
}

/// Closed set of backend commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RemoteStartTransaction,
    RemoteStopTransaction,
    GetConfiguration,
    ChangeConfiguration,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::RemoteStartTransaction => "remote_start_transaction",
            CommandKind::RemoteStopTransaction => "remote_stop_transaction",
            CommandKind::GetConfiguration => "get_configuration",
            CommandKind::ChangeConfiguration => "change_configuration",
        }
    }

    pub fn action(&self) -> Action {
        match self {
            CommandKind::RemoteStartTransaction => RemoteStart::ACTION,
            CommandKind::RemoteStopTransaction => RemoteStop::ACTION,
            CommandKind::GetConfiguration => GetConfiguration::ACTION,
            CommandKind::ChangeConfiguration => ChangeConfiguration::ACTION,
        }
    }

    /// Decode backend parameters into the OCPP CALL for this command
    pub fn to_call(&self, data: &Value) -> Result<Call, CommandError> {
        match self {
            CommandKind::RemoteStartTransaction => build_call::<RemoteStart>(data),
            CommandKind::RemoteStopTransaction => build_call::<RemoteStop>(data),
            CommandKind::GetConfiguration => build_call::<GetConfiguration>(data),
            CommandKind::ChangeConfiguration => build_call::<ChangeConfiguration>(data),
        }
    }

    /// Decode the charge point reply into this command's reply shape
    pub fn parse_reply(&self, result: &CallResult) -> Result<Map<String, Value>, CommandError> {
        match self {
            CommandKind::RemoteStartTransaction => read_reply::<RemoteStart>(result),
            CommandKind::RemoteStopTransaction => read_reply::<RemoteStop>(result),
            CommandKind::GetConfiguration => read_reply::<GetConfiguration>(result),
            CommandKind::ChangeConfiguration => read_reply::<ChangeConfiguration>(result),
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote_start_transaction" => Ok(CommandKind::RemoteStartTransaction),
            "remote_stop_transaction" => Ok(CommandKind::RemoteStopTransaction),
            "get_configuration" => Ok(CommandKind::GetConfiguration),
            "change_configuration" => Ok(CommandKind::ChangeConfiguration),
            _ => Err(CommandError::UnsupportedCommand(s.to_string())),
        }
    }
}

/// One backend command: its parameters, the OCPP request they become, and the reply
pub trait RemoteCommand {
    const ACTION: Action;
    type Params: DeserializeOwned;
    type Request: Serialize;
    type Reply: DeserializeOwned + Serialize;

    fn to_request(params: Self::Params) -> Self::Request;
}

fn build_call<C: RemoteCommand>(data: &Value) -> Result<Call, CommandError> {
    let params: C::Params = serde_json::from_value(data.clone())
        .map_err(|e| CommandError::InvalidPayload(e.to_string()))?;
    Ok(Call::new(C::ACTION, C::to_request(params))?)
}

fn read_reply<C: RemoteCommand>(result: &CallResult) -> Result<Map<String, Value>, CommandError> {
    let reply: C::Reply = result.parse_payload()?;
    match serde_json::to_value(reply).map_err(OcppError::from)? {
        Value::Object(map) => Ok(map),
        _ => Err(CommandError::Dispatch(OcppError::InvalidFormat)),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStartParams {
    pub tag: String,
    #[serde(default)]
    pub connector_id: Option<i32>,
    #[serde(default)]
    pub charging_profile: Option<Value>,
}

pub struct RemoteStart;

impl RemoteCommand for RemoteStart {
    const ACTION: Action = Action::RemoteStartTransaction;
    type Params = RemoteStartParams;
    type Request = RemoteStartTransactionRequest;
    type Reply = RemoteStartTransactionResponse;

    fn to_request(params: RemoteStartParams) -> RemoteStartTransactionRequest {
        RemoteStartTransactionRequest {
            id_tag: params.tag,
            connector_id: params.connector_id,
            charging_profile: params.charging_profile,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStopParams {
    pub transaction_id: i32,
}

pub struct RemoteStop;

impl RemoteCommand for RemoteStop {
    const ACTION: Action = Action::RemoteStopTransaction;
    type Params = RemoteStopParams;
    type Request = RemoteStopTransactionRequest;
    type Reply = RemoteStopTransactionResponse;

    fn to_request(params: RemoteStopParams) -> RemoteStopTransactionRequest {
        RemoteStopTransactionRequest {
            transaction_id: params.transaction_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetConfigurationParams {
    #[serde(default)]
    pub key: Option<Vec<String>>,
}

pub struct GetConfiguration;

impl RemoteCommand for GetConfiguration {
    const ACTION: Action = Action::GetConfiguration;
    type Params = GetConfigurationParams;
    type Request = GetConfigurationRequest;
    type Reply = GetConfigurationResponse;

    fn to_request(params: GetConfigurationParams) -> GetConfigurationRequest {
        GetConfigurationRequest {
            key: params.key.filter(|k| !k.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeConfigurationParams {
    pub key: String,
    pub value: String,
}

pub struct ChangeConfiguration;

impl RemoteCommand for ChangeConfiguration {
    const ACTION: Action = Action::ChangeConfiguration;
    type Params = ChangeConfigurationParams;
    type Request = ChangeConfigurationRequest;
    type Reply = ChangeConfigurationResponse;

    fn to_request(params: ChangeConfigurationParams) -> ChangeConfigurationRequest {
        ChangeConfigurationRequest {
            key: params.key,
            value: params.value,
        }
    }
}

/// Item of the backend command queue: `{"CpID": "...", "data": ...}`
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedCommand {
    #[serde(rename = "CpID", alias = "cp_id")]
    pub cp_id: String,
    pub data: QueuedPayload,
}

/// The two payload shapes found on the command queue
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueuedPayload {
    /// `[action, payload]` or a complete frame `[2, messageId, action, payload]`
    Frame(Vec<Value>),
    /// `{"command": ..., "data": ...}`; `command` is a backend command name or an OCPP action
    Object {
        #[serde(alias = "action")]
        command: String,
        #[serde(default, alias = "payload")]
        data: Value,
    },
}

impl QueuedCommand {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CommandError> {
        serde_json::from_slice(bytes).map_err(|e| CommandError::InvalidPayload(e.to_string()))
    }

    /// Build the CALL to forward to the charge point
    pub fn to_call(&self) -> Result<Call, CommandError> {
        match &self.data {
            QueuedPayload::Frame(frame) => match frame.as_slice() {
                [Value::String(action), payload] => Ok(Call::new(parse_action(action)?, payload)?),
                [_, _, _, _] => match OcppMessage::from_frame(frame) {
                    Ok(OcppMessage::Call(call)) => Ok(call),
                    Ok(_) => Err(CommandError::InvalidPayload("frame is not a CALL".into())),
                    Err(OcppError::UnknownAction(action)) => Err(CommandError::UnsupportedCommand(action)),
                    Err(e) => Err(CommandError::InvalidPayload(e.to_string())),
                },
                _ => Err(CommandError::InvalidPayload(format!(
                    "unexpected frame of {} elements",
                    frame.len()
                ))),
            },
            QueuedPayload::Object { command, data } => match command.parse::<CommandKind>() {
                Ok(kind) => kind.to_call(data),
                Err(_) => Ok(Call::new(parse_action(command)?, data)?),
            },
        }
    }
}

fn parse_action(name: &str) -> Result<Action, CommandError> {
    name.parse()
        .map_err(|_| CommandError::UnsupportedCommand(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_kind_names() {
        for kind in [
            CommandKind::RemoteStartTransaction,
            CommandKind::RemoteStopTransaction,
            CommandKind::GetConfiguration,
            CommandKind::ChangeConfiguration,
        ] {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
        }
        assert!(matches!(
            "reboot".parse::<CommandKind>(),
            Err(CommandError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn test_remote_start_call() {
        let call = CommandKind::RemoteStartTransaction
            .to_call(&json!({"tag": "RFID-1", "connector_id": 1}))
            .unwrap();

        assert_eq!(call.action, Action::RemoteStartTransaction);
        assert_eq!(call.payload, json!({"idTag": "RFID-1", "connectorId": 1}));
    }

    #[test]
    fn test_get_configuration_without_keys() {
        let call = CommandKind::GetConfiguration.to_call(&json!({"key": []})).unwrap();
        assert_eq!(call.payload, json!({}));
    }

    #[test]
    fn test_invalid_params() {
        let err = CommandKind::RemoteStopTransaction
            .to_call(&json!({"transaction_id": "abc"}))
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload(_)));
        assert_eq!(err.detail(), "Invalid command data");
    }

    #[test]
    fn test_parse_reply_keeps_device_fields() {
        let result = CallResult {
            message_id: "m".into(),
            payload: json!({"status": "RebootRequired"}),
        };
        let data = CommandKind::ChangeConfiguration.parse_reply(&result).unwrap();
        assert_eq!(Value::Object(data), json!({"status": "RebootRequired"}));
    }

    #[test]
    fn test_parse_reply_rejects_wrong_shape() {
        let result = CallResult {
            message_id: "m".into(),
            payload: json!({"state": "ok"}),
        };
        let err = CommandKind::RemoteStartTransaction.parse_reply(&result).unwrap_err();
        assert!(matches!(err, CommandError::Dispatch(_)));
    }

    #[test]
    fn test_response_flattens_reply() {
        let mut data = Map::new();
        data.insert("status".into(), json!("Accepted"));
        let response = RemoteCommandResponse { detail: "ok".into(), data };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"detail": "ok", "status": "Accepted"})
        );
    }

    #[test]
    fn test_queued_positional_frame() {
        let item = QueuedCommand::from_json(
            br#"{"CpID": "CP1", "data": ["RemoteStopTransaction", {"transactionId": 5}]}"#,
        )
        .unwrap();
        assert_eq!(item.cp_id, "CP1");

        let call = item.to_call().unwrap();
        assert_eq!(call.action, Action::RemoteStopTransaction);
        assert_eq!(call.payload, json!({"transactionId": 5}));
    }

    #[test]
    fn test_queued_full_frame_keeps_message_id() {
        let item = QueuedCommand::from_json(
            br#"{"CpID": "CP1", "data": [2, "abc-1", "Reset", {"type": "Soft"}]}"#,
        )
        .unwrap();

        let call = item.to_call().unwrap();
        assert_eq!(call.message_id, "abc-1");
        assert_eq!(call.action, Action::Reset);
    }

    #[test]
    fn test_queued_object_with_backend_command() {
        let item = QueuedCommand::from_json(
            br#"{"CpID": "CP1", "data": {"command": "remote_start_transaction", "data": {"tag": "T", "connector_id": 2}}}"#,
        )
        .unwrap();

        let call = item.to_call().unwrap();
        assert_eq!(call.action, Action::RemoteStartTransaction);
        assert_eq!(call.payload, json!({"idTag": "T", "connectorId": 2}));
    }

    #[test]
    fn test_queued_object_with_ocpp_action() {
        let item = QueuedCommand::from_json(
            br#"{"CpID": "CP1", "data": {"action": "UnlockConnector", "payload": {"connectorId": 1}}}"#,
        )
        .unwrap();

        let call = item.to_call().unwrap();
        assert_eq!(call.action, Action::UnlockConnector);
        assert_eq!(call.payload, json!({"connectorId": 1}));
    }

    #[test]
    fn test_queued_rejects_garbage() {
        assert!(QueuedCommand::from_json(b"not json").is_err());
        assert!(QueuedCommand::from_json(br#"{"data": []}"#).is_err());

        let item = QueuedCommand::from_json(br#"{"CpID": "CP1", "data": ["Explode", {}]}"#).unwrap();
        assert!(matches!(item.to_call(), Err(CommandError::UnsupportedCommand(_))));

        let item = QueuedCommand::from_json(br#"{"CpID": "CP1", "data": [1, 2, 3]}"#).unwrap();
        assert!(matches!(item.to_call(), Err(CommandError::InvalidPayload(_))));
    }
}
