//! Approval records and their integrity seal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome recorded by one approval event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Vote in favour; counts toward the step's `required_approvals`.
    Approved,
    /// Vote against.
    Rejected,
    /// Withdrawn vote written by external tooling; never counted.
    Revoked,
}

impl ApprovalStatus {
    /// Convert status to its storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Revoked => "revoked",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::Approved => 1,
            Self::Rejected => 2,
            Self::Revoked => 3,
        }
    }
}

/// One immutable approval or rejection event in an instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Actor who cast the vote.
    pub actor_id: String,
    /// Zero-based step index.
    pub step: usize,
    /// Vote outcome.
    pub status: ApprovalStatus,
    /// Sanitized, length-bounded comment.
    pub comment: String,
    /// When the vote was cast.
    pub timestamp: DateTime<Utc>,
    /// Delegator whose vote this is, when cast by a delegate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<String>,
    /// Keyed BLAKE3 hash over every other field, hex encoded.
    pub integrity_hash: String,
}

impl ApprovalRecord {
    /// Create and seal a record.
    #[must_use]
    pub fn new(
        actor_id: impl Into<String>,
        step: usize,
        status: ApprovalStatus,
        comment: impl Into<String>,
        timestamp: DateTime<Utc>,
        on_behalf_of: Option<String>,
        key: &IntegrityKey,
    ) -> Self {
        let mut record = Self {
            actor_id: actor_id.into(),
            step,
            status,
            comment: comment.into(),
            timestamp,
            on_behalf_of,
            integrity_hash: String::new(),
        };
        record.integrity_hash = key.seal(&record);
        record
    }

    /// The actor whose vote this record represents.
    #[must_use]
    pub fn voter(&self) -> &str {
        self.on_behalf_of.as_deref().unwrap_or(&self.actor_id)
    }

    /// Whether the stored hash matches the record's contents.
    #[must_use]
    pub fn verify(&self, key: &IntegrityKey) -> bool {
        key.seal(self) == self.integrity_hash
    }
}

/// Key for sealing approval records.
#[derive(Clone, PartialEq, Eq)]
pub struct IntegrityKey([u8; 32]);

impl IntegrityKey {
    const CONTEXT: &'static str = "approval-engine 2024-06 approval record integrity";

    /// Derive the key from a configured secret.
    #[must_use]
    pub fn derive(secret: &str) -> Self {
        Self(blake3::derive_key(Self::CONTEXT, secret.as_bytes()))
    }

    /// Key derived from the empty secret, used when none is configured.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self::derive("")
    }

    fn seal(&self, record: &ApprovalRecord) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(b"approval-record-v1:");

        hasher.update(&(record.actor_id.len() as u64).to_le_bytes());
        hasher.update(record.actor_id.as_bytes());

        hasher.update(&(record.step as u64).to_le_bytes());
        hasher.update(&[record.status.tag()]);

        hasher.update(&(record.comment.len() as u64).to_le_bytes());
        hasher.update(record.comment.as_bytes());

        hasher.update(&record.timestamp.timestamp_micros().to_le_bytes());

        match &record.on_behalf_of {
            Some(delegator) => {
                hasher.update(&[1]);
                hasher.update(&(delegator.len() as u64).to_le_bytes());
                hasher.update(delegator.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }

        hasher.finalize().to_hex().to_string()
    }
}

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegrityKey(..)")
    }
}

/// Strip control characters, trim, and bound a free-text comment to
/// `max_chars` characters.
#[must_use]
pub fn sanitize_comment(raw: &str, max_chars: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    cleaned.trim().chars().take(max_chars).collect()
}
