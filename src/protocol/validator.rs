//! Structural validation of inbound messages.
//!
//! Applied only on the WebSocket receive path (§4.B): REST bodies get
//! their structural checking for free from `serde`. A frame that fails
//! validation is never raised to a caller — it's logged and dropped so a
//! single corrupted frame can't wedge the engine.

use serde_json::Value;

use super::{Channel, KernelMessage};

/// Reason a message failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The header is missing a required field or has the wrong shape.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The `status` execution state on an iopub `status` message isn't one
    /// of the known literals.
    #[error("invalid execution_state: {0}")]
    InvalidExecutionState(String),

    /// A reply's `status` field isn't `ok`, `error`, or `abort`.
    #[error("invalid reply status: {0}")]
    InvalidReplyStatus(String),

    /// A required content field is missing or has the wrong type.
    #[error("invalid content for {msg_type}: {reason}")]
    InvalidContent {
        /// The `msg_type` of the offending message.
        msg_type: String,
        /// Human-readable explanation.
        reason: String,
    },
}

/// Validate a decoded message before it is dispatched anywhere.
///
/// Unknown message types are tolerated (they're forwarded as unhandled);
/// only malformed headers and known-but-misshapen content are rejected.
pub fn validate(msg: &KernelMessage) -> Result<(), ValidationError> {
    validate_header(msg)?;
    validate_content(msg)
}

fn validate_header(msg: &KernelMessage) -> Result<(), ValidationError> {
    if msg.header.msg_id.is_empty() {
        return Err(ValidationError::InvalidHeader("empty msg_id".into()));
    }
    if msg.header.session.is_empty() {
        return Err(ValidationError::InvalidHeader("empty session".into()));
    }
    if msg.header.username.is_empty() {
        return Err(ValidationError::InvalidHeader("empty username".into()));
    }
    if msg.header.version.is_empty() {
        return Err(ValidationError::InvalidHeader("empty version".into()));
    }
    // `channel` is a typed enum decoded from a closed set of literals, so an
    // invalid literal already fails upstream in the codec; nothing further
    // to check here beyond its presence, which the type system guarantees.
    let _: Channel = msg.channel;
    Ok(())
}

fn validate_content(msg: &KernelMessage) -> Result<(), ValidationError> {
    use super::KernelMessageType::*;

    match &msg.header.msg_type {
        Status => {
            let state = msg
                .content
                .get("execution_state")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ValidationError::InvalidContent {
                        msg_type: "status".into(),
                        reason: "missing execution_state".into(),
                    }
                })?;
            match state {
                "starting" | "idle" | "busy" | "restarting" | "dead" | "reconnecting" => Ok(()),
                other => Err(ValidationError::InvalidExecutionState(other.to_string())),
            }
        }
        ExecuteReply => {
            require_reply_status(msg, "execute_reply", true)?;
            let execution_count = msg.content.get("execution_count").and_then(Value::as_i64);
            match execution_count {
                Some(n) if n >= 0 => Ok(()),
                _ => Err(ValidationError::InvalidContent {
                    msg_type: "execute_reply".into(),
                    reason: "execution_count must be a non-negative integer".into(),
                }),
            }
        }
        InspectReply | CompleteReply | HistoryReply | IsCompleteReply | CommInfoReply
        | KernelInfoReply | ShutdownReply | InterruptReply => require_reply_status(
            msg,
            match &msg.header.msg_type {
                InspectReply => "inspect_reply",
                CompleteReply => "complete_reply",
                HistoryReply => "history_reply",
                IsCompleteReply => "is_complete_reply",
                CommInfoReply => "comm_info_reply",
                KernelInfoReply => "kernel_info_reply",
                ShutdownReply => "shutdown_reply",
                InterruptReply => "interrupt_reply",
                _ => unreachable!(),
            },
            false,
        ),
        CommOpen | CommMsg | CommClose => {
            let comm_id = msg.content.get("comm_id").and_then(Value::as_str);
            if comm_id.map(|s| !s.is_empty()).unwrap_or(false) {
                Ok(())
            } else {
                Err(ValidationError::InvalidContent {
                    msg_type: format!("{:?}", msg.header.msg_type),
                    reason: "missing comm_id".into(),
                })
            }
        }
        // Unknown/other message types are tolerated and routed as unhandled.
        _ => Ok(()),
    }
}

/// `execute_reply` requires `status` per spec; other reply types don't
/// necessarily carry a top-level `status` unless the kernel signals an
/// error/abort, so for those `required=false` only checks the field's
/// literal if present.
fn require_reply_status(msg: &KernelMessage, msg_type: &str, required: bool) -> Result<(), ValidationError> {
    match msg.content.get("status").and_then(Value::as_str) {
        None if required => Err(ValidationError::InvalidContent {
            msg_type: msg_type.into(),
            reason: "missing status".into(),
        }),
        None => Ok(()),
        Some("ok") | Some("error") | Some("abort") | Some("aborted") => Ok(()),
        Some(other) => Err(ValidationError::InvalidReplyStatus(format!(
            "{msg_type}: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Channel, KernelHeader, KernelMessageType};
    use serde_json::{json, Map};
    use time::OffsetDateTime;

    fn msg(msg_type: KernelMessageType, content: Value) -> KernelMessage {
        KernelMessage {
            header: KernelHeader {
                msg_id: "m1".into(),
                session: "s1".into(),
                username: "u1".into(),
                date: OffsetDateTime::now_utc(),
                msg_type,
                version: "5.4".into(),
            },
            parent_header: None,
            channel: Channel::IoPub,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    #[test]
    fn accepts_valid_status() {
        let m = msg(KernelMessageType::Status, json!({"execution_state": "idle"}));
        assert!(validate(&m).is_ok());
    }

    #[test]
    fn rejects_invalid_execution_state() {
        let m = msg(KernelMessageType::Status, json!({"execution_state": "sleeping"}));
        assert!(matches!(
            validate(&m),
            Err(ValidationError::InvalidExecutionState(_))
        ));
    }

    #[test]
    fn accepts_valid_execute_reply() {
        let m = msg(
            KernelMessageType::ExecuteReply,
            json!({"status": "ok", "execution_count": 3}),
        );
        assert!(validate(&m).is_ok());
    }

    #[test]
    fn rejects_execute_reply_missing_status() {
        let m = msg(KernelMessageType::ExecuteReply, json!({"execution_count": 3}));
        assert!(matches!(
            validate(&m),
            Err(ValidationError::InvalidContent { msg_type, .. }) if msg_type == "execute_reply"
        ));
    }

    #[test]
    fn tolerates_missing_status_on_other_reply_types() {
        let m = msg(KernelMessageType::KernelInfoReply, json!({"banner": "hi"}));
        assert!(validate(&m).is_ok());
    }

    #[test]
    fn rejects_negative_execution_count() {
        let m = msg(
            KernelMessageType::ExecuteReply,
            json!({"status": "ok", "execution_count": -1}),
        );
        assert!(validate(&m).is_err());
    }

    #[test]
    fn tolerates_unknown_message_types() {
        let m = msg(KernelMessageType::Other("custom_msg".into()), json!({}));
        assert!(validate(&m).is_ok());
    }

    #[test]
    fn rejects_empty_msg_id() {
        let mut m = msg(KernelMessageType::Status, json!({"execution_state": "idle"}));
        m.header.msg_id.clear();
        assert!(matches!(validate(&m), Err(ValidationError::InvalidHeader(_))));
    }
}
