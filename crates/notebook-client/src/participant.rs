//! Notebook participants.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a participant, as carried on acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Participant {
    /// A participant with a generated display name like `brave-otter`.
    pub fn new(id: ParticipantId) -> Self {
        let display_name = petname::petname(2, "-").unwrap_or_else(|| id.to_string());
        Self { id, display_name }
    }

    pub fn named(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// The local participant with a fresh id.
    pub fn local() -> Self {
        Self::new(ParticipantId::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_participant_gets_a_name() {
        let me = Participant::local();
        assert!(!me.display_name.is_empty());
        assert_ne!(me.id, Participant::local().id);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = ParticipantId::new("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""alice""#);
        assert_eq!(id.to_string(), "alice");
    }
}
