//! Embed lifecycle helpers (SPEC_FULL.md §3, §8 "Embed key coverage"). No
//! direct teacher equivalent — the Embed/EmbedKey concept is new to this
//! domain — so this is grounded purely on the invariants SPEC_FULL.md states
//! explicitly: a root embed has ≥1 EmbedKey; a child embed has none of its
//! own and shares its parent's wrapping path.

use sha2::{Digest, Sha256};

use openmates_core::types::EmbedId;

use crate::record_store::{EmbedKeyRecord, EmbedKeyWrapSource, EmbedRecord};

pub fn hash_embed_id(embed_id: &EmbedId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(embed_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// A skill-produced `SkillEmbed` (SPEC_FULL.md §4.H step 6), turned into a
/// freshly created root `EmbedRecord` plus the one `EmbedKeyRecord` it must
/// have. Child embeds never call this — they're created with `parent_embed_id`
/// set and no key of their own (`new_child_embed`).
pub fn new_root_embed(embed_type: String, encrypted_content: String, encrypted_type: String, wrapped_key: String, wrap_source: EmbedKeyWrapSource, now: i64) -> (EmbedRecord, EmbedKeyRecord) {
    let embed_id = EmbedId::new();
    let key = EmbedKeyRecord { hashed_embed_id: hash_embed_id(&embed_id), wrapped_key, wrap_source };
    let record = EmbedRecord {
        embed_id,
        parent_embed_id: None,
        embed_type,
        status: openmates_core::types::EmbedStatus::Processing,
        encrypted_content,
        encrypted_type,
        created_at: now,
        updated_at: now,
    };
    (record, key)
}

pub fn new_child_embed(parent_embed_id: EmbedId, embed_type: String, encrypted_content: String, encrypted_type: String, now: i64) -> EmbedRecord {
    EmbedRecord {
        embed_id: EmbedId::new(),
        parent_embed_id: Some(parent_embed_id),
        embed_type,
        status: openmates_core::types::EmbedStatus::Processing,
        encrypted_content,
        encrypted_type,
        created_at: now,
        updated_at: now,
    }
}

/// §8 "Embed key coverage": a root embed must have ≥1 matching `EmbedKeyRecord`;
/// a child must have none of its own.
pub fn check_key_coverage(embed: &EmbedRecord, keys: &[EmbedKeyRecord]) -> bool {
    let has_own_key = keys.iter().any(|k| k.hashed_embed_id == hash_embed_id(&embed.embed_id));
    match embed.parent_embed_id {
        None => has_own_key,
        Some(_) => !has_own_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_embed_has_exactly_one_key_satisfying_coverage() {
        let (embed, key) = new_root_embed("image".into(), "ct".into(), "png".into(), "wrapped".into(), EmbedKeyWrapSource::ChatKey, 0);
        assert!(check_key_coverage(&embed, &[key]));
    }

    #[test]
    fn child_embed_has_no_key_of_its_own() {
        let parent_id = EmbedId::new();
        let child = new_child_embed(parent_id, "tile".into(), "ct".into(), "png".into(), 0);
        assert!(check_key_coverage(&child, &[]));
    }

    #[test]
    fn root_embed_missing_its_key_fails_coverage() {
        let (embed, _key) = new_root_embed("image".into(), "ct".into(), "png".into(), "wrapped".into(), EmbedKeyWrapSource::ChatKey, 0);
        assert!(!check_key_coverage(&embed, &[]));
    }
}
