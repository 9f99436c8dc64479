//! C10: the Summary background worker (§4.6, §5 "Ambient Executors"). Runs
//! as a dedicated task behind a single-slot (buffer 1) channel: messages
//! trimmed out of the live context arrive here, get folded into a running
//! summary, and the result is published to a slot the Conversation Manager
//! reads fresh each turn (§4.5 step 3, step 9).
//!
//! Decay (§4.4 "Relevance decay") doesn't need the same worker shape —
//! `GreenMemoryEngine::maybe_decay` already single-flights concurrent calls
//! internally via an atomic flag, so the Conversation Manager just spawns
//! one fire-and-forget task per turn instead of routing through a channel.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use orakle_memory::types::Message;

use crate::provider::{ChatRequest, LlmProvider};

/// Upper bound on the published summary, as a fraction of the model's
/// context window. Truncated at the last sentence boundary so the summary
/// never ends mid-thought.
const SUMMARY_BUDGET_FRACTION: f32 = 0.05;
const CHARS_PER_TOKEN: f32 = 4.0;

/// Spawns the Summary worker and returns the sender side of its buffer-1
/// inbox. A full inbox means a summarization pass is already running —
/// callers use `try_send` and accept the drop; the next trimmed batch will
/// cover the gap once the worker catches up (§5 ordering guarantee c).
pub fn spawn_summary_worker(
    llm: Arc<dyn LlmProvider>,
    model: String,
    context_window: u32,
    slot: Arc<Mutex<Option<String>>>,
) -> mpsc::Sender<Vec<Message>> {
    let (tx, mut rx) = mpsc::channel::<Vec<Message>>(1);
    let retry_tx = tx.clone();

    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if batch.is_empty() {
                continue;
            }
            let previous = slot.lock().unwrap().clone();
            let prompt = build_prompt(previous.as_deref(), &batch);
            let req = ChatRequest {
                model: model.clone(),
                system: prompt,
                messages: Vec::new(),
                max_tokens: 512,
                stream: false,
                thinking: None,
            };
            match llm.send(&req).await {
                Ok(resp) => {
                    let bounded = truncate_to_budget(&resp.content, context_window);
                    *slot.lock().unwrap() = Some(bounded);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "summary worker: LLM call failed, requeuing batch");
                    if retry_tx.try_send(batch).is_err() {
                        tracing::warn!("summary worker: requeue failed, batch dropped");
                    }
                }
            }
        }
    });

    tx
}

fn build_prompt(previous: Option<&str>, batch: &[Message]) -> String {
    let turns = batch
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    match previous {
        Some(prev) if !prev.is_empty() => format!(
            "Existing summary of the conversation so far:\n{prev}\n\n\
             Fold in these additional turns and produce one updated summary \
             (a few sentences, no bullet list):\n\n{turns}"
        ),
        _ => format!(
            "Summarize the following conversation turns in a few sentences, \
             no bullet list:\n\n{turns}"
        ),
    }
}

fn truncate_to_budget(text: &str, context_window: u32) -> String {
    let max_chars = ((context_window as f32) * SUMMARY_BUDGET_FRACTION * CHARS_PER_TOKEN) as usize;
    if text.chars().count() <= max_chars {
        return text.trim().to_string();
    }

    let truncated: String = text.chars().take(max_chars).collect();
    match truncated.rfind(['.', '!', '?']) {
        Some(end) => truncated[..=end].trim().to_string(),
        None => truncated.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> Message {
        Message {
            id: orakle_core::types::MessageId(1),
            role: orakle_core::types::Role::User,
            content: content.to_string(),
            tokens: 6,
            timestamp: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn prompt_without_a_previous_summary_asks_for_a_fresh_one() {
        let batch = vec![msg("I just moved to Austin")];
        let prompt = build_prompt(None, &batch);
        assert!(prompt.contains("Summarize the following"));
        assert!(prompt.contains("I just moved to Austin"));
    }

    #[test]
    fn prompt_with_a_previous_summary_asks_to_fold_it_in() {
        let prompt = build_prompt(Some("User lives in Austin."), &[]);
        assert!(prompt.contains("Existing summary"));
        assert!(prompt.contains("User lives in Austin."));
    }

    #[test]
    fn short_text_is_returned_unchanged() {
        let out = truncate_to_budget("a short summary.", 128_000);
        assert_eq!(out, "a short summary.");
    }

    #[test]
    fn long_text_is_cut_at_the_last_sentence_boundary() {
        let sentence = "The user likes coffee. ";
        let long_text = sentence.repeat(500);
        let out = truncate_to_budget(&long_text, 1_000);
        // budget = 1000 * 0.05 * 4 = 200 chars
        assert!(out.len() <= 200);
        assert!(out.ends_with('.'));
    }
}
