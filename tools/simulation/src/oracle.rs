//! End-of-run invariant checks

use event_bus::{DeadLetter, OutboxRecord};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::producer::ProducerState;

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub invariant: &'static str,
    pub detail: String,
}

/// Everything observed once the pipeline has settled
pub struct Observation<'a> {
    pub state: &'a ProducerState,
    pub outbox: &'a [OutboxRecord],
    pub rejected_event_ids: &'a [String],
    pub applied: &'a HashMap<String, u32>,
    /// Failed handler runs per event_id
    pub handler_failures: &'a HashMap<String, u32>,
    pub cold_storage_keys: &'a [String],
    pub indexed_policies: usize,
    pub indexed_claims: usize,
    pub dead_letters: &'a [DeadLetter],
    pub malformed_injected: usize,
}

pub fn check(obs: &Observation<'_>) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut fail = |invariant: &'static str, detail: String| {
        violations.push(Violation { invariant, detail });
    };

    // Every committed mutation reaches the broker
    for record in obs.outbox.iter().filter(|r| !r.published) {
        fail(
            "outbox_drained",
            format!(
                "{} still pending after {} attempts (last error: {:?})",
                record.event_id(),
                record.publish_attempts,
                record.last_error
            ),
        );
    }

    // Rejected transactions leave neither state nor outbox rows
    let committed: BTreeSet<&str> = obs.outbox.iter().map(|r| r.event_id()).collect();
    for event_id in obs.rejected_event_ids {
        if committed.contains(event_id.as_str()) {
            fail("atomic_rejection", format!("{} reached the outbox", event_id));
        }
    }

    // Effectively-once: each committed event applied exactly once
    for event_id in &committed {
        match obs.applied.get(*event_id).copied().unwrap_or(0) {
            1 => {}
            n => fail("applied_once", format!("{} applied {} times", event_id, n)),
        }
    }
    for event_id in obs.applied.keys() {
        if !committed.contains(event_id.as_str()) {
            fail("applied_once", format!("{} applied but never committed", event_id));
        }
    }

    // One archived object per committed event
    let archived: BTreeSet<&str> = obs
        .cold_storage_keys
        .iter()
        .filter_map(|key| key.rsplit('/').next()?.strip_suffix(".json"))
        .collect();
    if archived.len() != obs.cold_storage_keys.len() {
        fail(
            "archived_once",
            format!(
                "{} objects for {} distinct events",
                obs.cold_storage_keys.len(),
                archived.len()
            ),
        );
    }
    for event_id in &committed {
        if !archived.contains(event_id) {
            fail("archived_once", format!("{} missing from cold storage", event_id));
        }
    }

    // One search document per entity
    if obs.indexed_policies != obs.state.policies.len() {
        fail(
            "indexed_by_entity",
            format!(
                "{} policy documents for {} policies",
                obs.indexed_policies,
                obs.state.policies.len()
            ),
        );
    }
    if obs.indexed_claims != obs.state.claims.len() {
        fail(
            "indexed_by_entity",
            format!(
                "{} claim documents for {} claims",
                obs.indexed_claims,
                obs.state.claims.len()
            ),
        );
    }

    // A valid event is dead-lettered only after faults spent its budget
    for letter in obs.dead_letters {
        let Ok(envelope) = letter.message.envelope() else {
            continue;
        };
        if obs.handler_failures.get(&envelope.event_id).copied().unwrap_or(0) == 0 {
            fail(
                "dead_lettered_without_fault",
                format!(
                    "{} dead-lettered by {} with no handler failure (reason: {})",
                    envelope.event_id, letter.source_queue, letter.reason
                ),
            );
        }
    }

    // Only the unparseable bodies end up dead-lettered
    let parseable = obs
        .dead_letters
        .iter()
        .filter(|d| d.message.envelope().is_ok())
        .count();
    if parseable > 0 {
        fail(
            "dead_letters_malformed_only",
            format!("{} valid events left in dead-letter", parseable),
        );
    }
    if obs.dead_letters.len() != obs.malformed_injected {
        fail(
            "dead_letters_malformed_only",
            format!(
                "{} dead letters for {} malformed bodies",
                obs.dead_letters.len(),
                obs.malformed_injected
            ),
        );
    }

    violations
}
