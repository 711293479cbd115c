#![forbid(unsafe_code)]

use collab_domain::{ChatRecord, ClientId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum inbound frame payload size: 10 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Message discriminator carried in the `type` field.
///
/// Types this server does not know about decode as `Unknown`; the hub
/// forwards those frames verbatim and mutates no state for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	ClientId,
	DocUpdate,
	Chat,
	ChatHistory,
	UserList,
	CursorUpdate,
	#[serde(other)]
	Unknown,
}

/// The tagged wire envelope. Only a subset of the fields is populated per
/// kind; absent fields are omitted from the encoded JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
	#[serde(rename = "type")]
	pub kind: MessageKind,

	/// Full-document snapshot (`doc_update`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,

	/// Chat text (`chat`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,

	/// Display name of the originator (`chat`, `cursor_update`, and the
	/// server-sent join `doc_update`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sender: Option<String>,

	/// Sender identity used for `doc_update` self-echo suppression.
	#[serde(default, rename = "clientUUID", skip_serializing_if = "Option::is_none")]
	pub client_uuid: Option<String>,

	/// Assigned identity (`client_id`, sent once per connection).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uuid: Option<String>,

	/// Current roster (`user_list`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub users: Option<Vec<String>>,

	/// Persisted chat tail, oldest first (`chat_history`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub history: Option<Vec<ChatRecord>>,

	/// Caret position (`cursor_update`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cursor: Option<i64>,
}

impl WireMessage {
	fn empty(kind: MessageKind) -> Self {
		Self {
			kind,
			content: None,
			message: None,
			sender: None,
			client_uuid: None,
			uuid: None,
			users: None,
			history: None,
			cursor: None,
		}
	}

	/// One-shot identity assignment frame.
	pub fn client_id(id: ClientId) -> Self {
		Self {
			uuid: Some(id.to_string()),
			..Self::empty(MessageKind::ClientId)
		}
	}

	/// Full-document snapshot frame.
	pub fn doc_update(content: impl Into<String>, sender: impl Into<String>) -> Self {
		Self {
			content: Some(content.into()),
			sender: Some(sender.into()),
			..Self::empty(MessageKind::DocUpdate)
		}
	}

	/// Roster frame.
	pub fn user_list(users: Vec<String>) -> Self {
		Self {
			users: Some(users),
			..Self::empty(MessageKind::UserList)
		}
	}

	/// Chat tail frame, records oldest first.
	pub fn chat_history(history: Vec<ChatRecord>) -> Self {
		Self {
			history: Some(history),
			..Self::empty(MessageKind::ChatHistory)
		}
	}

	/// Encode to the JSON text carried in a single frame.
	pub fn encode(&self) -> Result<String, CodecError> {
		Ok(serde_json::to_string(self)?)
	}

	/// Decode a frame payload.
	///
	/// Rejects oversized payloads before parsing; a payload that parses but
	/// carries an unrecognized `type` decodes successfully as `Unknown`.
	pub fn decode(payload: &str) -> Result<Self, CodecError> {
		if payload.len() > DEFAULT_MAX_FRAME_SIZE {
			return Err(CodecError::FrameTooLarge {
				len: payload.len(),
				max: DEFAULT_MAX_FRAME_SIZE,
			});
		}
		Ok(serde_json::from_str(payload)?)
	}

	/// Sender identity parsed from the `clientUUID` field, if present and
	/// well-formed.
	pub fn sender_identity(&self) -> Option<ClientId> {
		self.client_uuid.as_deref().and_then(|s| s.parse().ok())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn absent_fields_are_omitted() {
		let encoded = WireMessage::user_list(vec!["alice".into()]).encode().expect("encode");
		assert_eq!(encoded, r#"{"type":"user_list","users":["alice"]}"#);
	}

	#[test]
	fn client_uuid_keeps_wire_name() {
		let msg = WireMessage::decode(r#"{"type":"doc_update","content":"x","clientUUID":"abc"}"#).expect("decode");
		assert_eq!(msg.kind, MessageKind::DocUpdate);
		assert_eq!(msg.client_uuid.as_deref(), Some("abc"));
		assert!(msg.sender_identity().is_none(), "malformed uuid must not parse");
	}

	#[test]
	fn unrecognized_type_decodes_as_unknown() {
		let msg = WireMessage::decode(r#"{"type":"presence_blip","sender":"a"}"#).expect("decode");
		assert_eq!(msg.kind, MessageKind::Unknown);
	}

	#[test]
	fn missing_type_is_an_error() {
		assert!(WireMessage::decode(r#"{"content":"x"}"#).is_err());
		assert!(WireMessage::decode("not json").is_err());
	}
}
