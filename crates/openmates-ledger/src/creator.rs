//! Creator Income reservations (SPEC_FULL.md §4.I/§4.I.1). No direct teacher
//! or original_source equivalent — the distillation's Creator Income concept
//! doesn't exist in `usage.py`, so this follows the encrypted-entry shape
//! `usage.rs` is grounded on and adds the one claim rule §4.I.1 states
//! explicitly: `reserved -> claimed` exactly when the root embed a reservation
//! is attached to (by `invocation_id`) transitions to `Finished`.

use openmates_core::types::{CreatorIncomeStatus, EmbedStatus, InvocationId};
use openmates_transit::TransitClient;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CreatorIncomeEntry {
    pub invocation_id: InvocationId,
    pub status: CreatorIncomeStatus,
    pub encrypted_amount: String,
    pub created_at: i64,
}

/// Reserve a creator share for one skill invocation. Encrypted with the
/// system-level creator key (not the user's — the amount must be readable by
/// the billing surface regardless of which user's turn produced it).
pub async fn reserve_creator_income(
    transit: &TransitClient,
    creator_key_id: &str,
    invocation_id: InvocationId,
    amount_credits: f64,
    created_at: i64,
) -> Result<CreatorIncomeEntry> {
    let encrypted_amount = transit.encrypt_with_user_key(creator_key_id, &amount_credits.to_string()).await?;
    Ok(CreatorIncomeEntry { invocation_id, status: CreatorIncomeStatus::Reserved, encrypted_amount, created_at })
}

/// Apply the §4.I.1 claim rule for an embed-status transition on the embed
/// rooted at this reservation's `invocation_id`. Reservations already
/// `Claimed` are left untouched (the transition happens exactly once).
pub fn apply_embed_transition(entry: &mut CreatorIncomeEntry, embed_status: EmbedStatus) {
    if entry.status == CreatorIncomeStatus::Reserved && embed_status == EmbedStatus::Finished {
        entry.status = CreatorIncomeStatus::Claimed;
    }
    // `Error`, or no embed ever produced: stays `Reserved` indefinitely —
    // reconciling those is the out-of-scope billing surface's job (§4.I.1).
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CreatorIncomeEntry {
        CreatorIncomeEntry {
            invocation_id: InvocationId::new(),
            status: CreatorIncomeStatus::Reserved,
            encrypted_amount: "enc".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn finished_embed_claims_a_reserved_entry() {
        let mut e = entry();
        apply_embed_transition(&mut e, EmbedStatus::Finished);
        assert_eq!(e.status, CreatorIncomeStatus::Claimed);
    }

    #[test]
    fn errored_embed_leaves_the_entry_reserved() {
        let mut e = entry();
        apply_embed_transition(&mut e, EmbedStatus::Error);
        assert_eq!(e.status, CreatorIncomeStatus::Reserved);
    }

    #[test]
    fn already_claimed_entries_are_not_reopened() {
        let mut e = entry();
        e.status = CreatorIncomeStatus::Claimed;
        apply_embed_transition(&mut e, EmbedStatus::Error);
        assert_eq!(e.status, CreatorIncomeStatus::Claimed);
    }
}
