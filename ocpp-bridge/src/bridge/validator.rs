//! Remote command request validation

use serde_json::Value;

use crate::domain::RemoteCommandRequest;

pub const COMMAND_REQUIRED: &str = "Command required";
pub const CP_ID_REQUIRED: &str = "CpId required";
pub const DATA_REQUIRED: &str = "Data required";

/// First missing field of `req`, in the order command, cp_id, data
pub fn validate(req: &RemoteCommandRequest) -> Option<&'static str> {
    if req.command.is_empty() {
        return Some(COMMAND_REQUIRED);
    }
    if req.cp_id.is_empty() {
        return Some(CP_ID_REQUIRED);
    }
    if req.data == Value::Null {
        return Some(DATA_REQUIRED);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(cp_id: &str, command: &str, data: Value) -> RemoteCommandRequest {
        RemoteCommandRequest {
            cp_id: cp_id.into(),
            command: command.into(),
            data,
        }
    }

    #[test]
    fn test_checks_run_in_order() {
        assert_eq!(validate(&request("", "", Value::Null)), Some(COMMAND_REQUIRED));
        assert_eq!(validate(&request("CP1", "", json!({}))), Some(COMMAND_REQUIRED));
        assert_eq!(validate(&request("", "get_configuration", Value::Null)), Some(CP_ID_REQUIRED));
        assert_eq!(validate(&request("CP1", "get_configuration", Value::Null)), Some(DATA_REQUIRED));
    }

    #[test]
    fn test_complete_request_passes() {
        assert_eq!(validate(&request("CP1", "get_configuration", json!({}))), None);
        // Content is checked at dispatch, not here
        assert_eq!(validate(&request("CP1", "reboot", json!([]))), None);
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let req: RemoteCommandRequest = serde_json::from_str(r#"{"cp_id": "CP1"}"#).unwrap();
        assert_eq!(validate(&req), Some(COMMAND_REQUIRED));
    }
}
