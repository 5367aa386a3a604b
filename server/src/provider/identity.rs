//! Composite participant identity.
//!
//! The provider only stores an opaque "custom participant id" per participant.
//! We put `user_id[:session_id]` there so a participant listing can be mapped
//! back to our users. Session tokens are client-chosen, so any delimiter in
//! them is replaced before encoding.

use std::fmt;

use uuid::Uuid;

/// Separator between user id and session id.
pub const DELIMITER: char = ':';

/// Replacement for delimiter characters found inside a session token.
const SANITIZED: char = '_';

/// Identity embedded in a provider participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantIdentity {
    /// Owning user.
    pub user_id: Uuid,
    /// Client session, already sanitized.
    pub session_id: Option<String>,
}

impl ParticipantIdentity {
    /// Build an identity, sanitizing the session token.
    pub fn new(user_id: Uuid, session_id: Option<&str>) -> Self {
        Self {
            user_id,
            session_id: session_id
                .filter(|s| !s.is_empty())
                .map(sanitize_session),
        }
    }

    /// Encode as `user_id[:session_id]`.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Recover the identity from a provider custom participant id.
    ///
    /// Returns `None` for participants that were not created by us.
    pub fn parse(raw: &str) -> Option<Self> {
        let (user, session) = match raw.split_once(DELIMITER) {
            Some((user, session)) => (user, Some(session)),
            None => (raw, None),
        };
        let user_id = Uuid::parse_str(user).ok()?;
        Some(Self {
            user_id,
            session_id: session.filter(|s| !s.is_empty()).map(str::to_owned),
        })
    }

    /// Whether this identity belongs to `session_id` (compared after sanitizing).
    pub fn is_session(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(sanitize_session(session_id).as_str())
    }
}

impl fmt::Display for ParticipantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session) => write!(f, "{}{DELIMITER}{session}", self.user_id),
            None => write!(f, "{}", self.user_id),
        }
    }
}

/// Strip delimiter collisions out of a raw session token.
pub fn sanitize_session(raw: &str) -> String {
    raw.replace(DELIMITER, &SANITIZED.to_string())
}
