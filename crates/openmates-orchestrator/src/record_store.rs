//! The four repository interfaces SPEC_FULL.md §3.1 calls for, plus an
//! in-memory implementation of all four exercised by the end-to-end scenario
//! tests. Grounded on `skynet-sessions/src/manager.rs`'s
//! upsert-then-read-back style (here: `DashMap` entries instead of SQL rows)
//! and `skynet-scheduler/src/engine.rs`'s trait-per-aggregate shape. Keeping
//! the CMS's filter dialect out of the core (§9 "Record store coupling") means
//! these traits never leak a query language — only domain-shaped calls.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use openmates_core::types::{ChatId, EmbedId, EmbedStatus, InvocationId, Message, MessageId, UserId};
use openmates_ledger::{CreatorIncomeEntry, UsageEntry};

use crate::error::{RecordStoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct Chat {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub messages_v: u64,
    pub vault_key_id: String,
    pub language: String,
}

/// Opaque handle to a pre-debit reservation (§4.H step 4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationId(pub String);

#[derive(Debug, Clone)]
pub struct EmbedRecord {
    pub embed_id: EmbedId,
    pub parent_embed_id: Option<EmbedId>,
    pub embed_type: String,
    pub status: EmbedStatus,
    pub encrypted_content: String,
    pub encrypted_type: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// How an embed's content key is wrapped (§3 "EmbedKey"). Only root embeds
/// get one of these; children inherit the parent's wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedKeyWrapSource {
    ChatKey,
    UserMasterKey,
}

#[derive(Debug, Clone)]
pub struct EmbedKeyRecord {
    pub hashed_embed_id: String,
    pub wrapped_key: String,
    pub wrap_source: EmbedKeyWrapSource,
}

#[async_trait]
pub trait ChatRepo: Send + Sync {
    async fn get_chat(&self, chat_id: &ChatId) -> StoreResult<Chat>;
    async fn increment_messages_v(&self, chat_id: &ChatId) -> StoreResult<u64>;
    async fn get_credit_balance(&self, user_id: &UserId) -> StoreResult<i64>;
    async fn reserve_credits(&self, user_id: &UserId, amount: i64) -> StoreResult<ReservationId>;
    /// Debits `actual_total` and refunds the reservation's delta in one call
    /// (§4.H step 7: "Debit once; refund reserve delta").
    async fn settle_credits(&self, reservation_id: &ReservationId, actual_total: i64) -> StoreResult<()>;
    /// Releases a reservation without debiting anything (cancellation/failure path).
    async fn refund_credits(&self, reservation_id: &ReservationId) -> StoreResult<()>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn get_recent_messages(&self, chat_id: &ChatId, limit: usize) -> StoreResult<Vec<Message>>;
    /// Idempotent on `message_id`: a retried append with the same id is a no-op.
    async fn append_message(&self, chat_id: &ChatId, message_id: &MessageId, message: Message) -> StoreResult<()>;
}

#[async_trait]
pub trait EmbedRepo: Send + Sync {
    async fn create_embed(&self, embed: EmbedRecord) -> StoreResult<()>;
    async fn finish_embed(&self, embed_id: &EmbedId, encrypted_content: String) -> StoreResult<()>;
    async fn fail_embed(&self, embed_id: &EmbedId) -> StoreResult<()>;
    async fn add_embed_key(&self, key: EmbedKeyRecord) -> StoreResult<()>;
    async fn get_embed(&self, embed_id: &EmbedId) -> StoreResult<EmbedRecord>;
}

#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn append_usage(&self, entry: UsageEntry) -> StoreResult<()>;
    async fn append_creator_income(&self, invocation_id: InvocationId, entry: CreatorIncomeEntry) -> StoreResult<()>;
    async fn claim_creator_income(&self, invocation_id: &InvocationId) -> StoreResult<()>;
}

/// In-memory implementation of all four traits, the one the §8 end-to-end
/// scenarios exercise. Never intended for production; the real CMS client is
/// out of scope (DESIGN.md).
#[derive(Default)]
pub struct InMemoryStore {
    chats: DashMap<String, Chat>,
    balances: DashMap<String, AtomicI64>,
    reservations: DashMap<String, (String, i64)>,
    next_reservation: AtomicU64,
    messages: DashMap<String, Vec<(MessageId, Message)>>,
    embeds: DashMap<String, EmbedRecord>,
    embed_keys: DashMap<String, Vec<EmbedKeyRecord>>,
    usage: DashMap<String, Vec<UsageEntry>>,
    creator_income: DashMap<String, CreatorIncomeEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a chat + starting credit balance for a test scenario.
    pub fn seed_chat(&self, chat: Chat, credit_balance: i64) {
        self.balances.insert(chat.user_id.as_str().to_string(), AtomicI64::new(credit_balance));
        self.chats.insert(chat.chat_id.as_str().to_string(), chat);
    }

    pub fn usage_entries_for(&self, user_id: &UserId) -> Vec<UsageEntry> {
        let hash = openmates_ledger::sha256_hex(user_id.as_str());
        self.usage.get(&hash).map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatRepo for InMemoryStore {
    async fn get_chat(&self, chat_id: &ChatId) -> StoreResult<Chat> {
        self.chats.get(chat_id.as_str()).map(|c| c.clone()).ok_or_else(|| RecordStoreError::NotFound(chat_id.to_string()))
    }

    async fn increment_messages_v(&self, chat_id: &ChatId) -> StoreResult<u64> {
        let mut chat = self
            .chats
            .get_mut(chat_id.as_str())
            .ok_or_else(|| RecordStoreError::NotFound(chat_id.to_string()))?;
        chat.messages_v += 1;
        Ok(chat.messages_v)
    }

    async fn get_credit_balance(&self, user_id: &UserId) -> StoreResult<i64> {
        self.balances
            .get(user_id.as_str())
            .map(|b| b.load(Ordering::SeqCst))
            .ok_or_else(|| RecordStoreError::NotFound(user_id.to_string()))
    }

    async fn reserve_credits(&self, user_id: &UserId, amount: i64) -> StoreResult<ReservationId> {
        let balance = self.balances.get(user_id.as_str()).ok_or_else(|| RecordStoreError::NotFound(user_id.to_string()))?;
        let current = balance.load(Ordering::SeqCst);
        if current < amount {
            return Err(RecordStoreError::Conflict(format!("insufficient balance: have {current}, need {amount}")));
        }
        balance.fetch_sub(amount, Ordering::SeqCst);
        let id = self.next_reservation.fetch_add(1, Ordering::SeqCst);
        let reservation_id = format!("rsv-{id}");
        self.reservations.insert(reservation_id.clone(), (user_id.as_str().to_string(), amount));
        Ok(ReservationId(reservation_id))
    }

    async fn settle_credits(&self, reservation_id: &ReservationId, actual_total: i64) -> StoreResult<()> {
        let (_, (user_id, reserved)) = self
            .reservations
            .remove(&reservation_id.0)
            .ok_or_else(|| RecordStoreError::NotFound(reservation_id.0.clone()))?;
        // `amount` was already subtracted at reserve time; crediting back
        // `reserved - actual_total` leaves the balance down by exactly
        // `actual_total`, whether that's less or more than the reservation.
        let delta = reserved - actual_total;
        if let Some(balance) = self.balances.get(&user_id) {
            balance.fetch_add(delta, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn refund_credits(&self, reservation_id: &ReservationId) -> StoreResult<()> {
        let (_, (user_id, reserved)) = self
            .reservations
            .remove(&reservation_id.0)
            .ok_or_else(|| RecordStoreError::NotFound(reservation_id.0.clone()))?;
        if let Some(balance) = self.balances.get(&user_id) {
            balance.fetch_add(reserved, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepo for InMemoryStore {
    async fn get_recent_messages(&self, chat_id: &ChatId, limit: usize) -> StoreResult<Vec<Message>> {
        Ok(self
            .messages
            .get(chat_id.as_str())
            .map(|v| v.iter().rev().take(limit).map(|(_, m)| m.clone()).rev().collect())
            .unwrap_or_default())
    }

    async fn append_message(&self, chat_id: &ChatId, message_id: &MessageId, message: Message) -> StoreResult<()> {
        let mut entry = self.messages.entry(chat_id.as_str().to_string()).or_default();
        if entry.iter().any(|(id, _)| id == message_id) {
            return Ok(());
        }
        entry.push((message_id.clone(), message));
        Ok(())
    }
}

#[async_trait]
impl EmbedRepo for InMemoryStore {
    async fn create_embed(&self, embed: EmbedRecord) -> StoreResult<()> {
        self.embeds.insert(embed.embed_id.as_str().to_string(), embed);
        Ok(())
    }

    async fn finish_embed(&self, embed_id: &EmbedId, encrypted_content: String) -> StoreResult<()> {
        let mut e = self.embeds.get_mut(embed_id.as_str()).ok_or_else(|| RecordStoreError::NotFound(embed_id.to_string()))?;
        e.status = EmbedStatus::Finished;
        e.encrypted_content = encrypted_content;
        Ok(())
    }

    async fn fail_embed(&self, embed_id: &EmbedId) -> StoreResult<()> {
        let mut e = self.embeds.get_mut(embed_id.as_str()).ok_or_else(|| RecordStoreError::NotFound(embed_id.to_string()))?;
        e.status = EmbedStatus::Error;
        Ok(())
    }

    async fn add_embed_key(&self, key: EmbedKeyRecord) -> StoreResult<()> {
        self.embed_keys.entry(key.hashed_embed_id.clone()).or_default().push(key);
        Ok(())
    }

    async fn get_embed(&self, embed_id: &EmbedId) -> StoreResult<EmbedRecord> {
        self.embeds.get(embed_id.as_str()).map(|e| e.clone()).ok_or_else(|| RecordStoreError::NotFound(embed_id.to_string()))
    }
}

#[async_trait]
impl UsageRepo for InMemoryStore {
    async fn append_usage(&self, entry: UsageEntry) -> StoreResult<()> {
        self.usage.entry(entry.user_id_hash.clone()).or_default().push(entry);
        Ok(())
    }

    async fn append_creator_income(&self, invocation_id: InvocationId, entry: CreatorIncomeEntry) -> StoreResult<()> {
        self.creator_income.insert(invocation_id.as_str().to_string(), entry);
        Ok(())
    }

    async fn claim_creator_income(&self, invocation_id: &InvocationId) -> StoreResult<()> {
        let mut entry = self
            .creator_income
            .get_mut(invocation_id.as_str())
            .ok_or_else(|| RecordStoreError::NotFound(invocation_id.to_string()))?;
        openmates_ledger::apply_embed_transition(&mut entry, EmbedStatus::Finished);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chat() -> (Chat, UserId) {
        let user_id = UserId::new();
        let chat = Chat { chat_id: ChatId::new(), user_id: user_id.clone(), messages_v: 0, vault_key_id: "vk".into(), language: "en".into() };
        (chat, user_id)
    }

    #[tokio::test]
    async fn reserve_then_refund_restores_balance() {
        let store = InMemoryStore::new();
        let (chat, user_id) = test_chat();
        store.seed_chat(chat, 100);

        let reservation = store.reserve_credits(&user_id, 30).await.unwrap();
        assert_eq!(store.get_credit_balance(&user_id).await.unwrap(), 70);

        store.refund_credits(&reservation).await.unwrap();
        assert_eq!(store.get_credit_balance(&user_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn settle_credits_debits_exactly_the_actual_total() {
        let store = InMemoryStore::new();
        let (chat, user_id) = test_chat();
        store.seed_chat(chat, 100);

        let reservation = store.reserve_credits(&user_id, 30).await.unwrap();
        store.settle_credits(&reservation, 12).await.unwrap();
        assert_eq!(store.get_credit_balance(&user_id).await.unwrap(), 88);
    }

    #[tokio::test]
    async fn reserve_rejects_insufficient_balance() {
        let store = InMemoryStore::new();
        let (chat, user_id) = test_chat();
        store.seed_chat(chat, 10);
        assert!(store.reserve_credits(&user_id, 30).await.is_err());
    }

    #[tokio::test]
    async fn append_message_is_idempotent_on_message_id() {
        let store = InMemoryStore::new();
        let (chat, _user_id) = test_chat();
        let chat_id = chat.chat_id.clone();
        store.seed_chat(chat, 100);

        let message_id = MessageId::new();
        store.append_message(&chat_id, &message_id, Message::user("hi")).await.unwrap();
        store.append_message(&chat_id, &message_id, Message::user("hi")).await.unwrap();

        let recent = store.get_recent_messages(&chat_id, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn claim_creator_income_applies_the_finished_transition() {
        let store = InMemoryStore::new();
        let invocation_id = InvocationId::new();
        let entry = CreatorIncomeEntry {
            invocation_id: invocation_id.clone(),
            status: openmates_core::types::CreatorIncomeStatus::Reserved,
            encrypted_amount: "enc".into(),
            created_at: 0,
        };
        store.append_creator_income(invocation_id.clone(), entry).await.unwrap();
        store.claim_creator_income(&invocation_id).await.unwrap();
    }

    #[tokio::test]
    async fn usage_entries_for_finds_rows_appended_under_the_hashed_user_id() {
        let store = InMemoryStore::new();
        let user_id = UserId::new();
        let entry = UsageEntry {
            user_id_hash: openmates_ledger::sha256_hex(user_id.as_str()),
            encrypted_app_id: "enc-app".into(),
            encrypted_skill_id: "enc-skill".into(),
            usage_type: "skill".into(),
            created_at: 0,
            encrypted_credits_costs_total: "enc-cost".into(),
            encrypted_model_used: None,
            hashed_chat_id: None,
            hashed_message_id: None,
            encrypted_input_tokens: None,
            encrypted_output_tokens: None,
        };
        store.append_usage(entry).await.unwrap();

        assert_eq!(store.usage_entries_for(&user_id).len(), 1);
        assert!(store.usage_entries_for(&UserId::new()).is_empty());
    }
}
