//! Room metadata supplied by the transport when a session is opened.

use crate::error::SessionError;
use crate::model::{UserId, WordId};
use serde_json::Value;

pub const VOCABULARY_ROOM: &str = "vocabulary";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMetadata {
    pub room_type: String,
    pub user_id: UserId,
    pub chat_id: String,
    pub word_id: WordId,
}

impl RoomMetadata {
    /// Validates the raw metadata object.
    ///
    /// Ids may arrive as JSON integers or as numeric strings; both must be
    /// positive.
    pub fn parse(raw: &Value) -> Result<Self, SessionError> {
        let object = raw
            .as_object()
            .ok_or_else(|| invalid("metadata must be a JSON object"))?;

        let room_type = object
            .get("room_type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing room_type"))?;
        if room_type != VOCABULARY_ROOM {
            return Err(invalid(format!("unsupported room_type '{}'", room_type)));
        }

        let chat_id = object
            .get("chat_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing chat_id"))?;

        Ok(Self {
            room_type: room_type.to_string(),
            user_id: positive_id(object.get("user_id"), "user_id")?,
            chat_id: chat_id.to_string(),
            word_id: positive_id(object.get("word_id"), "word_id")?,
        })
    }
}

fn positive_id(value: Option<&Value>, field: &str) -> Result<i64, SessionError> {
    let id = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match id {
        Some(id) if id > 0 => Ok(id),
        Some(_) => Err(invalid(format!("{} must be positive", field))),
        None => Err(invalid(format!("missing or non-integer {}", field))),
    }
}

fn invalid(reason: impl Into<String>) -> SessionError {
    SessionError::InvalidMetadata(reason.into())
}
