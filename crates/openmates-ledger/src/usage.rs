//! Usage Entry construction (SPEC_FULL.md §4.I). Grounded directly on
//! `DirectusService.create_usage_entry` (original_source `usage.py`): the
//! field set, the SHA-256 one-way hashing of `user_id`/`chat_id`/`message_id`,
//! and the per-field `encrypt_with_user_key` calls are carried over as-is —
//! only the transport (Directus REST → `openmates-transit`) changed.

use openmates_core::types::{ChatId, MessageId, UserId};
use openmates_transit::TransitClient;
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// A metered event, ready to hand to the record store's usage repository.
/// Every field the original marks sensitive is already encrypted or hashed —
/// nothing here is plaintext except `usage_type` and the timestamp.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub user_id_hash: String,
    pub encrypted_app_id: String,
    pub encrypted_skill_id: String,
    pub usage_type: String,
    pub created_at: i64,
    pub encrypted_credits_costs_total: String,
    pub encrypted_model_used: Option<String>,
    pub hashed_chat_id: Option<String>,
    pub hashed_message_id: Option<String>,
    pub encrypted_input_tokens: Option<String>,
    pub encrypted_output_tokens: Option<String>,
}

/// Parameters for one usage entry. Kept as a builder-style struct rather than
/// a long parameter list, same shape as the Python keyword-argument call it's
/// grounded on.
#[derive(Debug, Clone)]
pub struct UsageEvent<'a> {
    pub user_id: &'a UserId,
    pub user_vault_key_id: &'a str,
    pub app_id: &'a str,
    pub skill_id: &'a str,
    pub usage_type: &'a str,
    pub created_at: i64,
    pub credits_charged: f64,
    pub model_used: Option<&'a str>,
    pub chat_id: Option<&'a ChatId>,
    pub message_id: Option<&'a MessageId>,
    pub actual_input_tokens: Option<u32>,
    pub actual_output_tokens: Option<u32>,
}

/// Build and encrypt one Usage Entry. `app_id`/`skill_id`/`credits_charged`
/// are mandatory fields in the original and failing to encrypt them aborts
/// entry creation entirely (`EncryptionFailed`); optional fields are best-effort.
pub async fn build_usage_entry(transit: &TransitClient, event: &UsageEvent<'_>) -> Result<UsageEntry> {
    let user_id_hash = sha256_hex(event.user_id.as_str());

    let encrypted_app_id = transit.encrypt_with_user_key(event.user_vault_key_id, event.app_id).await?;
    let encrypted_skill_id = transit.encrypt_with_user_key(event.user_vault_key_id, event.skill_id).await?;
    if encrypted_app_id.is_empty() || encrypted_skill_id.is_empty() {
        return Err(LedgerError::EncryptionFailed);
    }

    let encrypted_credits_costs_total = transit
        .encrypt_with_user_key(event.user_vault_key_id, &event.credits_charged.to_string())
        .await?;
    if encrypted_credits_costs_total.is_empty() {
        return Err(LedgerError::EncryptionFailed);
    }

    let encrypted_model_used = match event.model_used {
        Some(model) => Some(transit.encrypt_with_user_key(event.user_vault_key_id, model).await?),
        None => None,
    };

    let hashed_chat_id = event.chat_id.map(|id| sha256_hex(id.as_str()));
    let hashed_message_id = event.message_id.map(|id| sha256_hex(id.as_str()));

    let encrypted_input_tokens = match event.actual_input_tokens {
        Some(n) => Some(transit.encrypt_with_user_key(event.user_vault_key_id, &n.to_string()).await?),
        None => None,
    };
    let encrypted_output_tokens = match event.actual_output_tokens {
        Some(n) => Some(transit.encrypt_with_user_key(event.user_vault_key_id, &n.to_string()).await?),
        None => None,
    };

    Ok(UsageEntry {
        user_id_hash,
        encrypted_app_id,
        encrypted_skill_id,
        usage_type: event.usage_type.to_string(),
        created_at: event.created_at,
        encrypted_credits_costs_total,
        encrypted_model_used,
        hashed_chat_id,
        hashed_message_id,
        encrypted_input_tokens,
        encrypted_output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable_and_one_way() {
        let a = sha256_hex("user-123");
        let b = sha256_hex("user-123");
        let c = sha256_hex("user-124");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
