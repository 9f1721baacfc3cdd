//! Acting users as supplied by the caller layer.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Network origin signals attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrigin {
    /// Raw `X-Forwarded-For` header.
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header.
    #[serde(default)]
    pub real_ip: Option<String>,
    /// Peer address of the socket.
    #[serde(default)]
    pub remote_addr: Option<IpAddr>,
    /// Raw `User-Agent` header.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// An authenticated (or not) user acting on a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable user identifier.
    pub id: String,
    /// Roles held by the user.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Whether the caller layer authenticated this user.
    #[serde(default = "default_authenticated")]
    pub authenticated: bool,
    /// Whether the session passed multi-factor verification.
    #[serde(default)]
    pub mfa_verified: bool,
    /// Where the request came from.
    #[serde(default)]
    pub origin: RequestOrigin,
}

fn default_authenticated() -> bool {
    true
}

impl Actor {
    /// Create an authenticated actor with no roles.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
            authenticated: true,
            mfa_verified: false,
            origin: RequestOrigin::default(),
        }
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Mark the session as MFA-verified.
    #[must_use]
    pub fn with_mfa(mut self) -> Self {
        self.mfa_verified = true;
        self
    }

    /// Attach request origin signals.
    #[must_use]
    pub fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Mark the actor as unauthenticated.
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Whether the actor holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}
