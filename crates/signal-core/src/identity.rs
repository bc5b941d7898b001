use serde::{Deserialize, Serialize};
use std::fmt;

/// The `(uniqueID, applicationID)` pair a peer registers under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    #[serde(rename = "applicationID")]
    pub application_id: String,
}

impl Identity {
    pub fn new(unique_id: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            application_id: application_id.into(),
        }
    }

    pub fn from_parts(unique_id: Option<&str>, application_id: Option<&str>) -> Option<Self> {
        match (unique_id, application_id) {
            (Some(unique_id), Some(application_id))
                if !unique_id.is_empty() && !application_id.is_empty() =>
            {
                Some(Self::new(unique_id, application_id))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_id, self.unique_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub available: bool,
    pub broadcast: bool,
    #[serde(rename = "broadcastAppID")]
    pub broadcast_app_id: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub available: Option<bool>,
    pub broadcast: Option<bool>,
    pub broadcast_app_id: Option<bool>,
}

impl PresenceUpdate {
    pub fn is_empty(&self) -> bool {
        self.available.is_none() && self.broadcast.is_none() && self.broadcast_app_id.is_none()
    }
}

impl Presence {
    pub fn apply(&mut self, update: PresenceUpdate) {
        if let Some(available) = update.available {
            self.available = available;
        }
        if let Some(broadcast) = update.broadcast {
            self.broadcast = broadcast;
        }
        if let Some(broadcast_app_id) = update.broadcast_app_id {
            self.broadcast_app_id = broadcast_app_id;
        }
    }
}
