//! C9: the Conversation Manager — the per-turn orchestration in §4.5. Owns
//! slash commands, the reasoning heuristic, system message composition,
//! context trimming, the guardrail retry loop around [`DispatchMiddleware`],
//! document-block recognition, and the end-of-turn memory/decay
//! bookkeeping.
//!
//! One instance owns one conversation's state (one [`ChatMemory`], one
//! [`GreenMemoryEngine`]) — the data model's "single relational database
//! file per context" (§3, §6) is enforced one level up, by constructing a
//! fresh `ConversationManager` per context.
//!
//! The data model calls the system message "single, mutable" (§3), but
//! `ChatMemory` is append-only by contract. Those aren't in tension: the
//! system message is never stored as a row at all. It's recomposed fresh
//! into `ChatRequest.system` every turn from the base prompt plus whatever
//! summary/profile/memory sections currently apply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use orakle_core::config::ConversationConfig;
use orakle_core::tokens;
use orakle_core::types::{MemoryId, MemoryKind, Role as CoreRole};
use orakle_core::OrakleError;
use orakle_memory::chat_memory::ChatMemory;
use orakle_memory::error::MemoryError;
use orakle_memory::green::{AssimilationAction, AssimilationDecision, GreenMemoryEngine, MemoryAssimilator, MemorySynthesizer};
use orakle_memory::types::{Memory, Message as MemMessage};
use orakle_protocol::frames::{Event, StreamFlags};

use crate::heuristic;
use crate::middleware::{DispatchMiddleware, TurnOutcome, GUARDRAIL_MARKER};
use crate::provider::{ChatRequest, LlmProvider, Message as ProviderMessage, Role as ProviderRole};
use crate::template::{self, TemplateRenderer};
use crate::trim::trim_to_window;

const BASE_SYSTEM_PROMPT: &str = "You are Orakle, a conversational assistant that can call out to \
external skills when a request needs one. Answer directly when you can.";

/// Audio synthesis backend for plain-text reply segments (§4.5 step 8). No
/// concrete backend ships here — real TTS/STT is an explicit non-goal —
/// this only gives the Conversation Manager a seam to call through.
#[async_trait]
pub trait TtsSink: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<TtsAudio, OrakleError>;
}

#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub url: String,
    pub format: String,
    pub duration: f32,
}

#[derive(Debug, PartialEq)]
enum TextSegment {
    Plain(String),
    Document { format: String, body: String },
}

/// Splits a finished reply on fenced code blocks so each becomes a
/// `ui/setView` + `content/full` pair instead of ordinary streamed text
/// (§4.5 step 7, §6). An unterminated fence is left as plain text — there's
/// no close to act on.
fn split_document_blocks(text: &str) -> Vec<TextSegment> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        if start > 0 {
            segments.push(TextSegment::Plain(rest[..start].to_string()));
        }
        let after_fence = &rest[start + 3..];
        let format_end = after_fence.find('\n').unwrap_or(after_fence.len());
        let format = after_fence[..format_end].trim().to_string();
        let body_start = (format_end + 1).min(after_fence.len());
        let body_rest = &after_fence[body_start..];

        match body_rest.find("```") {
            Some(end) => {
                segments.push(TextSegment::Document {
                    format,
                    body: body_rest[..end].to_string(),
                });
                rest = &body_rest[end + 3..];
            }
            None => {
                segments.push(TextSegment::Plain(format!("```{after_fence}")));
                rest = "";
            }
        }
    }

    if !rest.is_empty() {
        segments.push(TextSegment::Plain(rest.to_string()));
    }
    segments
}

/// Splits on sentence-ending punctuation, keeping the punctuation with the
/// sentence it closes. A trailing fragment with no terminator is still
/// emitted — better to speak a partial sentence than drop it (§4.5 step 8).
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

/// Strips a leading `[HH:MM]` timestamp prefix before a sentence is handed
/// to TTS (§4.5 step 8) — those are meant to be read on screen, not spoken.
fn strip_timestamp_prefix(s: &str) -> &str {
    let trimmed = s.trim_start();
    let Some(rest) = trimmed.strip_prefix('[') else {
        return s;
    };
    let Some(end) = rest.find(']') else { return s };
    let inside = &rest[..end];
    let looks_like_time = inside.len() == 5
        && inside.as_bytes()[2] == b':'
        && inside[..2].bytes().all(|b| b.is_ascii_digit())
        && inside[3..].bytes().all(|b| b.is_ascii_digit());
    if looks_like_time {
        rest[end + 1..].trim_start()
    } else {
        s
    }
}

fn map_role(role: CoreRole) -> Option<ProviderRole> {
    match role {
        CoreRole::User => Some(ProviderRole::User),
        CoreRole::Assistant => Some(ProviderRole::Assistant),
        CoreRole::System => Some(ProviderRole::System),
        // Tool-role rows have no equivalent on the wire-level chat
        // message shape; they're folded into assistant content upstream
        // of `ChatMemory`, so none should reach here in practice.
        CoreRole::Tool => None,
    }
}

/// C9: per-turn orchestration for a single conversation.
pub struct ConversationManager {
    dispatch: DispatchMiddleware,
    chat_memory: Arc<ChatMemory>,
    memory: Arc<GreenMemoryEngine>,
    synthesizer: Arc<dyn MemorySynthesizer>,
    assimilator: Arc<dyn MemoryAssimilator>,
    tts: Option<Arc<dyn TtsSink>>,
    templates: TemplateRenderer,
    /// Latest text published by the (not-yet-run, single-slot) Summary
    /// worker; read fresh into the system message each turn.
    summary_slot: Arc<Mutex<Option<String>>>,
    /// Buffer-1 channel to the Summary worker; trimmed-out messages are
    /// handed off here rather than discarded (§4.5 step 4, §4.6).
    summary_tx: mpsc::Sender<Vec<MemMessage>>,
    config: ConversationConfig,
    memory_enabled: AtomicBool,
    model: String,
    max_tokens: u32,
    context_window: u32,
}

impl ConversationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatch: DispatchMiddleware,
        chat_memory: Arc<ChatMemory>,
        memory: Arc<GreenMemoryEngine>,
        synthesizer: Arc<dyn MemorySynthesizer>,
        assimilator: Arc<dyn MemoryAssimilator>,
        tts: Option<Arc<dyn TtsSink>>,
        summary_slot: Arc<Mutex<Option<String>>>,
        summary_tx: mpsc::Sender<Vec<MemMessage>>,
        config: ConversationConfig,
        model: String,
        max_tokens: u32,
        context_window: u32,
    ) -> Self {
        let memory_enabled = AtomicBool::new(config.memory_enabled_default);
        Self {
            dispatch,
            chat_memory,
            memory,
            synthesizer,
            assimilator,
            tts,
            templates: template::default_renderer(),
            summary_slot,
            summary_tx,
            config,
            memory_enabled,
            model,
            max_tokens,
            context_window,
        }
    }

    /// Runs one full turn: slash commands, LLM round with guardrail
    /// retries, reply emission, and background memory bookkeeping. Returns
    /// once `signal/completed` has been sent.
    pub async fn handle_turn(&self, user_input: &str, tx: mpsc::Sender<Event>) -> Result<(), OrakleError> {
        if self.handle_slash_command(user_input, &tx).await? {
            return Ok(());
        }

        let input_tokens = tokens::estimate(user_input);
        self.chat_memory
            .append(CoreRole::User, user_input, input_tokens, serde_json::json!({}))?;

        let score = heuristic::reasoning_score(user_input, self.config.reasoning_max_level);
        let level = heuristic::level_for_score(score);
        let _ = tx.send(Event::loading_start_reasoning(score)).await;

        let system_message = self.compose_system_message(user_input)?;
        let system_tokens = tokens::estimate(&system_message);
        let budget = self.context_window.saturating_sub(system_tokens);

        let history: Vec<MemMessage> = self
            .chat_memory
            .since(None)?
            .into_iter()
            .filter(|m| m.role != CoreRole::System)
            .collect();
        let trimmed = trim_to_window(&history, budget);
        if !trimmed.summarize.is_empty() {
            let _ = self.summary_tx.try_send(trimmed.summarize);
        }

        let messages: Vec<ProviderMessage> = trimmed
            .kept
            .iter()
            .filter_map(|m| {
                map_role(m.role).map(|role| ProviderMessage {
                    role,
                    content: m.content.clone(),
                })
            })
            .collect();

        let mut request = ChatRequest {
            model: self.model.clone(),
            system: system_message,
            messages,
            max_tokens: self.max_tokens,
            stream: true,
            thinking: Some(level),
        };

        let chat_context = self.build_chat_context(&history);

        let mut reply_text: Option<String> = None;
        for attempt in 0..=self.config.max_guardrail_retries {
            match self.dispatch.run_once(&request, &chat_context, &tx).await? {
                TurnOutcome::Halted => break,
                TurnOutcome::Reply(text) => {
                    if text.contains(GUARDRAIL_MARKER) && attempt < self.config.max_guardrail_retries {
                        request.messages.push(ProviderMessage {
                            role: ProviderRole::User,
                            content: "Your previous reply tripped the content guardrail and was not \
                                      shown. Answer again without triggering it."
                                .to_string(),
                        });
                        continue;
                    }
                    reply_text = Some(text.replace(GUARDRAIL_MARKER, ""));
                    break;
                }
            }
        }

        if let Some(text) = reply_text {
            for segment in split_document_blocks(&text) {
                match segment {
                    TextSegment::Plain(t) => self.emit_plain(&t, &tx).await,
                    TextSegment::Document { format, body } => {
                        let _ = tx.send(Event::set_view_document(format)).await;
                        let _ = tx.send(Event::content_full(body)).await;
                    }
                }
            }
            let out_tokens = tokens::estimate(&text);
            self.chat_memory
                .append(CoreRole::Assistant, &text, out_tokens, serde_json::json!({}))?;
        }

        let _ = tx.send(Event::loading_stop()).await;
        let _ = tx.send(Event::completed()).await;

        self.spawn_background_bookkeeping();
        Ok(())
    }

    async fn handle_slash_command(&self, input: &str, tx: &mpsc::Sender<Event>) -> Result<bool, OrakleError> {
        let trimmed = input.trim();

        if trimmed == "/memory" {
            self.memory_enabled.store(true, Ordering::SeqCst);
            let _ = tx.send(Event::set_memory_state(true)).await;
            let _ = tx.send(Event::info_message("Contextual memory is now enabled.")).await;
            let _ = tx.send(Event::completed()).await;
            return Ok(true);
        }
        if trimmed == "/nomemory" {
            self.memory_enabled.store(false, Ordering::SeqCst);
            let _ = tx.send(Event::set_memory_state(false)).await;
            let _ = tx.send(Event::info_message("Contextual memory is now disabled.")).await;
            let _ = tx.send(Event::completed()).await;
            return Ok(true);
        }
        if let Some(rest) = trimmed.strip_prefix("/testdocview ") {
            let (format, content) = rest.split_once(',').unwrap_or((rest, ""));
            let _ = tx.send(Event::set_view_document(format.trim().to_string())).await;
            let _ = tx.send(Event::content_full(content.trim().to_string())).await;
            let _ = tx.send(Event::completed()).await;
            return Ok(true);
        }
        if let Some(rest) = trimmed.strip_prefix("/testnexus ") {
            let mut parts = rest.splitn(2, ' ');
            let triple = parts.next().unwrap_or_default();
            let json_part = parts.next().unwrap_or_default().trim();
            let component_path = triple.split(',').map(str::trim).collect::<Vec<_>>().join("/");
            let data: serde_json::Value = serde_json::from_str(json_part).unwrap_or(serde_json::Value::Null);
            let _ = tx.send(Event::render_nexus(component_path, data, trimmed.to_string())).await;
            let _ = tx.send(Event::completed()).await;
            return Ok(true);
        }

        Ok(false)
    }

    fn compose_system_message(&self, user_input: &str) -> Result<String, OrakleError> {
        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("base", BASE_SYSTEM_PROMPT.to_string());

        if let Some(summary) = self.summary_slot.lock().unwrap().clone() {
            ctx.insert("summary_section", format!("\n\nConversation summary so far:\n{summary}"));
        }

        if self.memory_enabled.load(Ordering::SeqCst) {
            let profile = self
                .memory
                .generate_user_profile_summary(self.synthesizer.as_ref())
                .map_err(OrakleError::from)?;
            if !profile.is_empty() {
                ctx.insert("profile_section", format!("\n\nWhat you know about this user:\n{profile}"));
            }

            let recent = self
                .memory
                .generate_recent_memories_summary(self.synthesizer.as_ref())
                .map_err(OrakleError::from)?;
            if !recent.is_empty() {
                ctx.insert("recent_memories_section", format!("\n\nRecently learned:\n{recent}"));
            }

            let relevant = self.memory.get_relevant_memories(user_input, &[]).map_err(OrakleError::from)?;
            if !relevant.is_empty() {
                let lines = relevant
                    .iter()
                    .map(|m| format!("- {}", m.display_text))
                    .collect::<Vec<_>>()
                    .join("\n");
                ctx.insert("relevant_memories_section", format!("\n\nPossibly relevant memories:\n{lines}"));
            }
        }

        self.templates
            .render(template::names::SYSTEM_MESSAGE, &ctx)
            .map_err(|e| OrakleError::Fatal(e.to_string()))
    }

    /// Profile summary, running conversation summary, and the last
    /// `interpretation_context_messages` non-system messages — the "optional
    /// chat context" a command-interpretation prompt may carry (§4.3 step 7).
    fn build_chat_context(&self, history: &[MemMessage]) -> String {
        let mut sections = Vec::new();

        if self.memory_enabled.load(Ordering::SeqCst) {
            if let Ok(profile) = self.memory.generate_user_profile_summary(self.synthesizer.as_ref()) {
                if !profile.is_empty() {
                    sections.push(format!("User profile:\n{profile}"));
                }
            }
        }

        if let Some(summary) = self.summary_slot.lock().unwrap().clone() {
            sections.push(format!("Conversation summary:\n{summary}"));
        }

        let n = self.config.interpretation_context_messages;
        let recent: Vec<String> = history.iter().rev().take(n).rev().map(|m| format!("{}: {}", m.role, m.content)).collect();
        if !recent.is_empty() {
            sections.push(format!("Recent messages:\n{}", recent.join("\n")));
        }

        sections.join("\n\n")
    }

    async fn emit_plain(&self, text: &str, tx: &mpsc::Sender<Event>) {
        let Some(sink) = &self.tts else {
            if !text.is_empty() {
                let _ = tx.send(Event::message_stream(text.to_string(), StreamFlags::default())).await;
            }
            return;
        };

        for sentence in split_sentences(text) {
            let stripped = strip_timestamp_prefix(&sentence);
            if stripped.trim().is_empty() {
                continue;
            }
            match sink.synthesize(stripped).await {
                Ok(audio) => {
                    let _ = tx
                        .send(Event::message_stream_with_audio(
                            stripped.to_string(),
                            StreamFlags {
                                audio: true,
                                ..Default::default()
                            },
                            audio.url,
                            audio.format,
                        ))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tts synthesis failed, falling back to text");
                    let _ = tx
                        .send(Event::message_stream(stripped.to_string(), StreamFlags::default()))
                        .await;
                }
            }
        }
    }

    /// Spawns the two end-of-turn background passes (§4.5 step 9, §4.6):
    /// memory assimilation over whatever new turns landed since the last
    /// pass, and a relevance-decay check gated by `decay_interval_turns`.
    /// Both are fire-and-forget — a failed pass is logged and skipped, the
    /// turn that triggered it has already completed successfully.
    fn spawn_background_bookkeeping(&self) {
        let memory = self.memory.clone();
        let chat_memory = self.chat_memory.clone();
        let assimilator = self.assimilator.clone();
        tokio::spawn(async move {
            if let Err(e) = memory.process_new_messages_for_update(chat_memory.as_ref(), assimilator.as_ref()) {
                tracing::warn!(error = %e, "memory assimilation pass failed");
            }
        });

        let memory = self.memory.clone();
        tokio::spawn(async move {
            if let Err(e) = memory.maybe_decay() {
                tracing::warn!(error = %e, "relevance decay pass failed");
            }
        });
    }
}

/// LLM-backed [`MemorySynthesizer`]: turns a narrative prompt into prose via
/// a single non-streaming call. Bridges into the async provider from the
/// synchronous trait method `orakle-memory` requires (it can't depend on
/// `orakle-engine` itself, so the LLM half is always injected this way).
pub struct LlmSynthesizer {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, model: String) -> Self {
        Self { llm, model }
    }
}

impl MemorySynthesizer for LlmSynthesizer {
    fn synthesize(&self, prompt: &str) -> Result<String, MemoryError> {
        let req = ChatRequest {
            model: self.model.clone(),
            system: prompt.to_string(),
            messages: Vec::new(),
            max_tokens: 400,
            stream: false,
            thinking: None,
        };
        let llm = self.llm.clone();
        let resp = tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(llm.send(&req)))
            .map_err(|e| MemoryError::Llm(e.to_string()))?;
        Ok(resp.content)
    }
}

/// LLM-backed [`MemoryAssimilator`]: renders the `memory_assimilation`
/// template, parses the model's JSON verdict into an [`AssimilationDecision`].
pub struct LlmAssimilator {
    llm: Arc<dyn LlmProvider>,
    model: String,
    templates: TemplateRenderer,
}

impl LlmAssimilator {
    pub fn new(llm: Arc<dyn LlmProvider>, model: String) -> Self {
        Self {
            llm,
            model,
            templates: template::default_renderer(),
        }
    }
}

impl MemoryAssimilator for LlmAssimilator {
    fn decide(&self, turn_context: &str, candidates: &[Memory]) -> Result<AssimilationDecision, MemoryError> {
        let candidates_text = candidates
            .iter()
            .map(|m| format!("- id={} topic={} relevance={:.2}: {}", m.id, m.topic, m.relevance, m.text))
            .collect::<Vec<_>>()
            .join("\n");

        let mut ctx: HashMap<&str, String> = HashMap::new();
        ctx.insert("turn_context", turn_context.to_string());
        ctx.insert("candidates", candidates_text);
        let prompt = self
            .templates
            .render(template::names::MEMORY_ASSIMILATION, &ctx)
            .map_err(|e| MemoryError::Llm(e.to_string()))?;

        let req = ChatRequest {
            model: self.model.clone(),
            system: prompt,
            messages: Vec::new(),
            max_tokens: 400,
            stream: false,
            thinking: None,
        };
        let llm = self.llm.clone();
        let resp = tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(llm.send(&req)))
            .map_err(|e| MemoryError::Llm(e.to_string()))?;

        parse_assimilation_decision(&resp.content)
    }
}

fn parse_assimilation_decision(text: &str) -> Result<AssimilationDecision, MemoryError> {
    let json_text = extract_json(text);
    let value: serde_json::Value = serde_json::from_str(json_text).map_err(|e| MemoryError::Llm(e.to_string()))?;

    let action_str = value.get("action").and_then(|v| v.as_str()).unwrap_or("ignore");
    let action = match action_str {
        "reinforce" => AssimilationAction::Reinforce {
            memory_id: value
                .get("memory_id")
                .and_then(|v| v.as_str())
                .map(MemoryId::from)
                .ok_or_else(|| MemoryError::Llm("reinforce action is missing memory_id".to_string()))?,
            new_text: value.get("new_text").and_then(|v| v.as_str()).map(String::from),
        },
        "create" => AssimilationAction::Create {
            target: value
                .get("target")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(MemoryKind::Extended),
            topic: value.get("topic").and_then(|v| v.as_str()).unwrap_or("general").to_string(),
            text: value.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        },
        _ => AssimilationAction::Ignore,
    };

    let past_memory_ids = value
        .get("past_memory_ids")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(MemoryId::from).collect())
        .unwrap_or_default();
    let duplicates = value
        .get("duplicates")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(MemoryId::from).collect())
        .unwrap_or_default();

    Ok(AssimilationDecision::new(action).with_past(past_memory_ids).with_duplicates(duplicates))
}

fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_a_single_fenced_block_out_of_surrounding_text() {
        let segments = split_document_blocks("before\n```json\n{\"a\":1}\n```\nafter");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], TextSegment::Plain("before\n".to_string()));
        assert_eq!(
            segments[1],
            TextSegment::Document {
                format: "json".to_string(),
                body: "{\"a\":1}\n".to_string(),
            }
        );
        assert_eq!(segments[2], TextSegment::Plain("\nafter".to_string()));
    }

    #[test]
    fn unterminated_fence_falls_back_to_plain_text() {
        let segments = split_document_blocks("before ```js\nconsole.log(1)");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], TextSegment::Plain("before ".to_string()));
        match &segments[1] {
            TextSegment::Plain(t) => assert!(t.starts_with("```js")),
            other => panic!("expected Plain, got {other:?}"),
        }
    }

    #[test]
    fn text_with_no_fence_is_a_single_plain_segment() {
        let segments = split_document_blocks("just a normal reply");
        assert_eq!(segments, vec![TextSegment::Plain("just a normal reply".to_string())]);
    }

    #[test]
    fn sentence_splitter_keeps_terminators_with_their_sentence() {
        let sentences = split_sentences("Hi there! How are you? Fine.");
        assert_eq!(sentences, vec!["Hi there!", " How are you?", " Fine."]);
    }

    #[test]
    fn sentence_splitter_keeps_a_trailing_fragment() {
        let sentences = split_sentences("Still thinking");
        assert_eq!(sentences, vec!["Still thinking"]);
    }

    #[test]
    fn timestamp_prefix_is_stripped() {
        assert_eq!(strip_timestamp_prefix("[12:30] the weather is nice"), "the weather is nice");
    }

    #[test]
    fn non_timestamp_bracket_is_left_alone() {
        assert_eq!(strip_timestamp_prefix("[note] remember this"), "[note] remember this");
    }

    #[test]
    fn parses_a_create_decision_from_embedded_json() {
        let reply = "Sure thing:\n```json\n{\"action\":\"create\",\"target\":\"key\",\"topic\":\"pets\",\"text\":\"has a cat\"}\n```";
        let decision = parse_assimilation_decision(reply).unwrap();
        match decision.action {
            AssimilationAction::Create { target, topic, text } => {
                assert_eq!(target, MemoryKind::Key);
                assert_eq!(topic, "pets");
                assert_eq!(text, "has a cat");
            }
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn missing_action_defaults_to_ignore() {
        let decision = parse_assimilation_decision("{}").unwrap();
        matches!(decision.action, AssimilationAction::Ignore);
    }
}
