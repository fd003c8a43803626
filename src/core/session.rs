//! Session identity: who we are, which session we joined, and the role
//! that decides negotiation politeness.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Host created the session id; peer joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Peer,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Peer => f.write_str("peer"),
        }
    }
}

/// Tie-break rule for simultaneous negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Rolls back its own offer when offers collide.
    Polite,
    /// Ignores a colliding remote offer.
    Impolite,
}

/// Immutable for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    session_id: String,
    client_id: String,
    role: Role,
}

impl SessionIdentity {
    /// Create a fresh session; the creator is always the host.
    pub fn host() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            client_id: Uuid::new_v4().to_string(),
            role: Role::Host,
        }
    }

    /// Join a session someone else created.
    pub fn join(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: Uuid::new_v4().to_string(),
            role: Role::Peer,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    /// Politeness is `not host`.
    pub fn politeness(&self) -> Politeness {
        if self.is_host() {
            Politeness::Impolite
        } else {
            Politeness::Polite
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_impolite() {
        let id = SessionIdentity::host();
        assert_eq!(id.role(), Role::Host);
        assert_eq!(id.politeness(), Politeness::Impolite);
    }

    #[test]
    fn test_joiner_is_polite_and_keeps_session_id() {
        let id = SessionIdentity::join("abc");
        assert_eq!(id.session_id(), "abc");
        assert_eq!(id.role(), Role::Peer);
        assert_eq!(id.politeness(), Politeness::Polite);
        assert_ne!(id.client_id(), "abc");
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Host).unwrap(), "\"host\"");
        assert_eq!(serde_json::to_string(&Role::Peer).unwrap(), "\"peer\"");
    }
}
