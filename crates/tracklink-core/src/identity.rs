//! Identity graph vocabulary.
//!
//! Every identifier resolves to exactly one primary identity: the first link
//! for an `(identifier_type, identifier_value)` pair wins and is never
//! rewritten. Primary identities themselves are grouped by a persisted
//! union-find forest, so lookups always answer with the set's root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    VisitorId,
    ContactId,
    DeviceSignature,
}

impl IdentifierType {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::VisitorId => "visitor_id",
            IdentifierType::ContactId => "contact_id",
            IdentifierType::DeviceSignature => "device_signature",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim() {
            "visitor_id" => Ok(IdentifierType::VisitorId),
            "contact_id" => Ok(IdentifierType::ContactId),
            "device_signature" => Ok(IdentifierType::DeviceSignature),
            _ => Err(EngineError::validation(
                "identifier_type",
                "must be one of: visitor_id, contact_id, device_signature",
            )),
        }
    }
}

/// A stored row of the identity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub primary_identity_id: String,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub source: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A link request; `created_at` is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdentityLink {
    pub primary_identity_id: String,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub source: String,
    pub confidence: f64,
}

impl NewIdentityLink {
    pub fn new(
        primary_identity_id: &str,
        identifier_type: IdentifierType,
        identifier_value: &str,
        source: &str,
        confidence: f64,
    ) -> Self {
        Self {
            primary_identity_id: primary_identity_id.to_string(),
            identifier_type,
            identifier_value: identifier_value.to_string(),
            source: source.to_string(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    Created,
    /// The identifier already maps to the same identity set.
    AlreadyLinked,
    /// The identifier belongs to a different identity; the existing mapping
    /// is kept.
    Conflict { existing_primary_id: String },
}

/// Per-visitor lifecycle: `Unlinked → Linked → ContactAttached`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityState {
    Unlinked,
    Linked {
        primary_identity_id: String,
    },
    ContactAttached {
        primary_identity_id: String,
        contact_id: String,
    },
}

impl IdentityState {
    /// Classify a visitor from its resolved root and the contact ids linked
    /// into that root's set.
    pub fn classify(root: Option<String>, contact_ids: &[String]) -> Self {
        match (root, contact_ids.first()) {
            (None, _) => IdentityState::Unlinked,
            (Some(primary_identity_id), None) => IdentityState::Linked { primary_identity_id },
            (Some(primary_identity_id), Some(contact_id)) => IdentityState::ContactAttached {
                primary_identity_id,
                contact_id: contact_id.clone(),
            },
        }
    }
}

/// Generate a new primary identity id: "pid_" + 32 hex chars.
pub fn new_primary_identity_id() -> String {
    format!("pid_{}", uuid::Uuid::new_v4().simple())
}

/// Lock name guarding session propagation for one identity.
///
/// Hashed so arbitrary id formats map to a fixed-width key.
pub fn identity_lock_key(primary_identity_id: &str) -> String {
    let hash = Sha256::digest(format!("identity:{primary_identity_id}").as_bytes());
    format!("identity_{}", hex::encode(&hash[..8]))
}
