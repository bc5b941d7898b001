use crate::identity::{Identity, PresenceUpdate};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const RESPONSE_OK: &str = "ok";
pub const RESPONSE_ERROR: &str = "error";

const CONTACT_UNIQUE_ID: &str = "contactUniqueID";
const CONTACT_APPLICATION_ID: &str = "contactApplicationID";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Display strings are part of the wire contract.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Unable to read request")]
    Unreadable(#[from] ProtocolError),
    #[error("Access Denied")]
    AccessDenied,
    #[error("No contacts, searching")]
    NoContacts,
    #[error("No contacts, unable to find contact.")]
    ContactNotFound,
}

impl SignalError {
    pub fn reply(&self) -> Value {
        json!({
            "response": RESPONSE_ERROR,
            "error": self.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundFields {
    #[serde(default, rename = "uniqueID")]
    pub unique_id: Option<String>,
    #[serde(default, rename = "applicationID")]
    pub application_id: Option<String>,
    #[serde(default, rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub broadcast: Option<bool>,
    #[serde(default, rename = "broadcastAppID")]
    pub broadcast_app_id: Option<bool>,
    #[serde(default, rename = "contactUniqueID")]
    pub contact_unique_id: Option<String>,
    #[serde(default, rename = "contactApplicationID")]
    pub contact_application_id: Option<String>,
}

impl InboundFields {
    pub fn identity(&self) -> Option<Identity> {
        Identity::from_parts(self.unique_id.as_deref(), self.application_id.as_deref())
    }

    pub fn contact(&self) -> Option<Identity> {
        Identity::from_parts(
            self.contact_unique_id.as_deref(),
            self.contact_application_id.as_deref(),
        )
    }

    pub fn presence(&self) -> PresenceUpdate {
        PresenceUpdate {
            available: self.available,
            broadcast: self.broadcast,
            broadcast_app_id: self.broadcast_app_id,
        }
    }

    pub fn grants_access(&self, access_token: &str) -> bool {
        self.identity().is_some() && self.access_token.as_deref() == Some(access_token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub fields: InboundFields,
    pub body: Map<String, Value>,
}

pub fn decode_client_message(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<ClientMessage, ProtocolError> {
    if bytes.len() > max_frame_bytes {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let fields = InboundFields::deserialize(&value)?;
    let Value::Object(body) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    Ok(ClientMessage { fields, body })
}

pub fn settings_reply(settings: bool) -> Value {
    json!({
        "response": RESPONSE_OK,
        "settings": settings,
    })
}

pub fn unavailable_reply(contact: &Identity) -> Value {
    json!({
        CONTACT_UNIQUE_ID: contact.unique_id,
        CONTACT_APPLICATION_ID: contact.application_id,
        "response": RESPONSE_OK,
        "available": false,
    })
}

/// Rewrites a contact message for delivery: the contact fields now name the
/// sender so the target can reply.
pub fn forward_payload(mut body: Map<String, Value>, sender: &Identity) -> Value {
    body.insert(
        CONTACT_UNIQUE_ID.to_string(),
        Value::String(sender.unique_id.clone()),
    );
    body.insert(
        CONTACT_APPLICATION_ID.to_string(),
        Value::String(sender.application_id.clone()),
    );
    body.insert("response".to_string(), Value::String(RESPONSE_OK.to_string()));
    body.insert("available".to_string(), Value::Bool(true));
    Value::Object(body)
}
