//! Event contracts accepted by the ingestion worker
//!
//! Each `(event_type, event_version)` pair lists the payload fields the
//! worker relies on. Anything else is rejected as permanent and ends up in
//! the dead-letter destination.

use event_bus::SchemaRegistry;

pub const POLICIES_TOPIC: &str = "policies";
pub const CLAIMS_TOPIC: &str = "claims";

pub const POLICY_CREATED: &str = "PolicyCreated";
pub const POLICY_UPDATED: &str = "PolicyUpdated";
pub const CLAIM_CREATED: &str = "ClaimCreated";
pub const CLAIM_UPDATED: &str = "ClaimUpdated";

const POLICY_FIELDS: &[&str] = &["/policy", "/policy/policy_id|/policy/policyId"];
const CLAIM_FIELDS: &[&str] = &[
    "/claim",
    "/claim/claim_id|/claim/claimId",
    "/claim/policy_id|/claim/policyId",
];

/// Business domain an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Policies,
    Claims,
}

impl Domain {
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            POLICY_CREATED | POLICY_UPDATED => Some(Domain::Policies),
            CLAIM_CREATED | CLAIM_UPDATED => Some(Domain::Claims),
            _ => None,
        }
    }

    /// Path segment and index suffix: "policies" / "claims"
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Policies => "policies",
            Domain::Claims => "claims",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Domain::Policies => POLICIES_TOPIC,
            Domain::Claims => CLAIMS_TOPIC,
        }
    }
}

/// Registry of every contract the worker understands
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .register(POLICY_CREATED, 1, POLICY_FIELDS)
        .register(POLICY_UPDATED, 1, POLICY_FIELDS)
        .register(CLAIM_CREATED, 1, CLAIM_FIELDS)
        .register(CLAIM_UPDATED, 1, CLAIM_FIELDS)
}
