//! Usage and Creator Income ledger construction (SPEC_FULL.md §4.I). Builds
//! encrypted entries ready for the record store; persistence itself lives in
//! `openmates-orchestrator::record_store`, which owns the repository traits.

pub mod creator;
pub mod error;
pub mod usage;

pub use creator::{apply_embed_transition, reserve_creator_income, CreatorIncomeEntry};
pub use error::{LedgerError, Result};
pub use usage::{build_usage_entry, sha256_hex, UsageEntry, UsageEvent};
