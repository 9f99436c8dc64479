//! C9 step 4: trims conversation history to fit a token budget. Operates on
//! the turn history only — the rendered system message is accounted for
//! separately by the caller, which subtracts its token count from `budget`
//! before calling in.

use orakle_memory::types::Message;

#[derive(Debug, Clone)]
pub struct TrimResult {
    /// Oldest-first messages to send to the model.
    pub kept: Vec<Message>,
    /// Oldest-first messages dropped from `kept`, earmarked for the Summary
    /// worker (§4.6) rather than discarded outright.
    pub summarize: Vec<Message>,
}

/// Keeps the most recent user+assistant pair unconditionally, then walks the
/// rest newest-to-oldest keeping whatever fits in the remaining budget. The
/// first message that doesn't fit — and everything older than it — is
/// pushed into `summarize` and the walk stops there (§4.5 step 4, §8).
pub fn trim_to_window(messages: &[Message], budget: u32) -> TrimResult {
    if messages.is_empty() {
        return TrimResult {
            kept: Vec::new(),
            summarize: Vec::new(),
        };
    }

    let total: u32 = messages.iter().map(|m| m.tokens).sum();
    if total <= budget {
        return TrimResult {
            kept: messages.to_vec(),
            summarize: Vec::new(),
        };
    }

    let last_idx = messages.len() - 1;
    let tail_start = last_idx.saturating_sub(1);
    let tail_tokens: u32 = messages[tail_start..].iter().map(|m| m.tokens).sum();
    let mut remaining_budget = budget.saturating_sub(tail_tokens) as i64;

    let mut kept_from = tail_start;
    let mut summarize_end: Option<usize> = None;

    if tail_start > 0 {
        for i in (0..tail_start).rev() {
            let cost = messages[i].tokens as i64;
            if cost <= remaining_budget {
                remaining_budget -= cost;
                kept_from = i;
            } else {
                summarize_end = Some(i + 1);
                break;
            }
        }
    }

    let kept = messages[kept_from..].to_vec();
    let summarize = match summarize_end {
        Some(end) => messages[..end].to_vec(),
        None => Vec::new(),
    };

    TrimResult { kept, summarize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orakle_core::types::{MessageId, Role};

    fn msg(id: i64, role: Role, tokens: u32) -> Message {
        Message {
            id: MessageId(id),
            role,
            content: format!("message {id}"),
            tokens,
            timestamp: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn under_budget_keeps_everything() {
        let messages = vec![msg(1, Role::User, 50), msg(2, Role::Assistant, 50)];
        let result = trim_to_window(&messages, 200);
        assert_eq!(result.kept.len(), 2);
        assert!(result.summarize.is_empty());
    }

    #[test]
    fn most_recent_pair_is_always_kept_even_if_it_alone_exceeds_budget() {
        let messages = vec![msg(1, Role::User, 500), msg(2, Role::Assistant, 500)];
        let result = trim_to_window(&messages, 100);
        assert_eq!(result.kept.len(), 2);
        assert!(result.summarize.is_empty());
    }

    #[test]
    fn walks_backward_keeping_what_fits_and_summarizes_the_rest() {
        let messages = vec![
            msg(1, Role::User, 100),
            msg(2, Role::Assistant, 100),
            msg(3, Role::User, 100),
            msg(4, Role::Assistant, 100),
            msg(5, Role::User, 100),
            msg(6, Role::Assistant, 100),
            msg(7, Role::User, 100),
            msg(8, Role::Assistant, 100),
        ];
        // last pair (7,8) = 200 tokens, budget 700 leaves 500 for the rest.
        let result = trim_to_window(&messages, 700);
        assert_eq!(result.kept.len(), 7);
        assert_eq!(result.summarize.len(), 1);
        assert_eq!(result.summarize[0].id, MessageId(1));
    }

    #[test]
    fn exact_fit_triggers_no_trimming() {
        let messages = vec![msg(1, Role::User, 100), msg(2, Role::Assistant, 100)];
        let result = trim_to_window(&messages, 200);
        assert!(result.summarize.is_empty());
        assert_eq!(result.kept.len(), 2);
    }
}
