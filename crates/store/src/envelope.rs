use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use turnloop_core::message::Message;
use turnloop_core::session::Session;

use crate::error::StoreError;

/// Current on-disk format.
pub const ENVELOPE_VERSION: u32 = 1;

/// The persisted form of a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionEnvelope {
    pub version: u32,
    pub id: String,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<serde_json::Value>,
}

impl SessionEnvelope {
    pub fn into_session(self) -> Session {
        Session::from_parts(
            self.id,
            self.system_prompt,
            self.created_at,
            self.updated_at,
            self.messages,
        )
    }
}

impl From<&Session> for SessionEnvelope {
    fn from(session: &Session) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: session.id().to_string(),
            system_prompt: session.system_prompt().to_string(),
            created_at: session.created_at(),
            updated_at: session.updated_at(),
            messages: session.messages().to_vec(),
        }
    }
}

/// Serialize a session as a pretty-printed version 1 envelope.
pub fn encode(session: &Session) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(&SessionEnvelope::from(session)).map_err(StoreError::Encode)
}

/// Parse an envelope.
///
/// The version is checked before the body, so a future format fails with
/// [`StoreError::UnsupportedVersion`] rather than a confusing field error.
pub fn decode(bytes: &[u8]) -> Result<Session, StoreError> {
    let probe: VersionProbe = serde_json::from_slice(bytes).map_err(StoreError::Decode)?;
    let version = probe.version.ok_or(StoreError::MissingVersion)?;
    match version.as_u64() {
        Some(v) if v == u64::from(ENVELOPE_VERSION) => {}
        Some(found) => {
            return Err(StoreError::UnsupportedVersion {
                found,
                expected: ENVELOPE_VERSION,
            });
        }
        None => return Err(StoreError::MissingVersion),
    }

    let envelope: SessionEnvelope = serde_json::from_slice(bytes).map_err(StoreError::Decode)?;
    Ok(envelope.into_session())
}
