//! History transformation and truncation (SPEC_FULL.md §4.H steps 1-2).
//! Grounded on `truncate_message_history_to_token_budget` (original_source
//! `llm_utils.py`): newest-first preference, approximate `len/4` token
//! counting via the pluggable `TokenEstimator` (SPEC_FULL.md §9).

use openmates_core::token_estimator::TokenEstimator;
use openmates_core::types::Message;

/// Keep the newest messages that fit in `budget_tokens`, dropping the oldest
/// first. Never splits a single message; a message that alone exceeds the
/// budget is still kept if it's the only one (so the main stage always has
/// at least the latest turn).
pub fn truncate_to_token_budget(messages: &[Message], budget_tokens: usize, estimator: &dyn TokenEstimator) -> Vec<Message> {
    let mut kept: Vec<Message> = Vec::new();
    let mut used = 0usize;

    for message in messages.iter().rev() {
        let cost = estimator.estimate(&message.content);
        if used + cost > budget_tokens && !kept.is_empty() {
            break;
        }
        used += cost;
        kept.push(message.clone());
    }

    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use openmates_core::token_estimator::CharDivFourEstimator;

    fn msg(content: &str) -> Message {
        Message::user(content)
    }

    #[test]
    fn keeps_newest_messages_first() {
        let estimator = CharDivFourEstimator;
        let messages = vec![msg("a".repeat(40).as_str()), msg("b".repeat(40).as_str()), msg("c".repeat(40).as_str())];
        let kept = truncate_to_token_budget(&messages, 20, &estimator);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "c".repeat(40));
    }

    #[test]
    fn keeps_everything_when_it_fits() {
        let estimator = CharDivFourEstimator;
        let messages = vec![msg("short"), msg("also short")];
        let kept = truncate_to_token_budget(&messages, 10_000, &estimator);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn an_oversized_single_message_is_still_kept() {
        let estimator = CharDivFourEstimator;
        let messages = vec![msg("x".repeat(10_000).as_str())];
        let kept = truncate_to_token_budget(&messages, 10, &estimator);
        assert_eq!(kept.len(), 1);
    }
}
