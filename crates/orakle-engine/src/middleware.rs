//! C8: scans LLM output for the `<<<ORAKLE ... ORAKLE` skill-dispatch
//! sentinel, resolves and invokes the matched skill, and folds the result
//! back into the reply (§4.3). Also owns the `[AINARA GUARDRAIL]` retry
//! loop and the `<think>` pre-filter.

use std::collections::HashMap;
use std::sync::Arc;

use orakle_core::OrakleError;
use orakle_protocol::frames::{Event, StreamFlags};
use orakle_protocol::skill_wire::{RunRequest, RunResult};
use orakle_skills::descriptor::SkillType;
use orakle_skills::matcher::{SemanticMatcher, SkillMatch};
use orakle_skills::registry_client::SkillRegistryClient;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::StreamEvent;
use crate::template::{self, TemplateRenderer};

const OPEN_SENTINEL: &str = "<<<ORAKLE";

/// Marker a guardrail-triggered LLM reply carries; the Conversation Manager
/// owns the retry decision and the corrective-turn bookkeeping (§4.3, §4.5
/// step 6) — this module only needs to know the literal string so it can be
/// shared without a circular dependency.
pub const GUARDRAIL_MARKER: &str = "[AINARA GUARDRAIL]";

/// Streaming scanner for the `<<<ORAKLE ... ORAKLE[;]` sentinel pair. The
/// close line is any line whose trimmed content is exactly `ORAKLE` or
/// `ORAKLE;` — not a regex, just a line-by-line string comparison, since the
/// grammar is that simple.
pub struct DispatchScanner {
    buffer: String,
    state: ScanState,
    command_buf: String,
}

enum ScanState {
    Text,
    InCommand,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Text(String),
    Command(String),
}

impl Default for DispatchScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchScanner {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            state: ScanState::Text,
            command_buf: String::new(),
        }
    }

    /// Feeds a chunk of text (or an entire buffered reply) through the
    /// scanner, returning every complete event it can extract. Incomplete
    /// sentinels or command bodies are carried internally to the next call.
    pub fn feed(&mut self, chunk: &str) -> Vec<ScanEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match self.state {
                ScanState::Text => {
                    if let Some(pos) = self.buffer.find(OPEN_SENTINEL) {
                        if pos > 0 {
                            events.push(ScanEvent::Text(self.buffer[..pos].to_string()));
                        }
                        self.buffer.drain(..pos + OPEN_SENTINEL.len());
                        if self.buffer.starts_with('\n') {
                            self.buffer.drain(..1);
                        }
                        self.state = ScanState::InCommand;
                        self.command_buf.clear();
                        continue;
                    }

                    let keep = longest_partial_suffix_match(&self.buffer, OPEN_SENTINEL);
                    let emit_len = self.buffer.len() - keep;
                    if emit_len > 0 {
                        events.push(ScanEvent::Text(self.buffer[..emit_len].to_string()));
                        self.buffer.drain(..emit_len);
                    }
                    break;
                }
                ScanState::InCommand => {
                    if let Some((content_end, consumed)) = find_close_line(&self.buffer) {
                        self.command_buf.push_str(&self.buffer[..content_end]);
                        self.buffer.drain(..consumed);
                        events.push(ScanEvent::Command(std::mem::take(&mut self.command_buf)));
                        self.state = ScanState::Text;
                        continue;
                    }

                    // No close line yet — park everything up to the last
                    // newline in the command buffer; keep only the
                    // still-incomplete final line for the next feed.
                    if let Some(last_nl) = self.buffer.rfind('\n') {
                        self.command_buf.push_str(&self.buffer[..=last_nl]);
                        self.buffer.drain(..=last_nl);
                    }
                    break;
                }
            }
        }

        events
    }
}

fn longest_partial_suffix_match(buf: &str, needle: &str) -> usize {
    let max_chars = needle.chars().count().saturating_sub(1);
    let chars: Vec<char> = buf.chars().collect();
    let upper = max_chars.min(chars.len());
    for take in (1..=upper).rev() {
        let suffix: String = chars[chars.len() - take..].iter().collect();
        if needle.starts_with(&suffix) {
            return suffix.len();
        }
    }
    0
}

fn find_close_line(buf: &str) -> Option<(usize, usize)> {
    let mut start = 0;
    while let Some(rel_nl) = buf[start..].find('\n') {
        let nl = start + rel_nl;
        let trimmed = buf[start..nl].trim();
        if trimmed == "ORAKLE" || trimmed == "ORAKLE;" {
            return Some((start, nl + 1));
        }
        start = nl + 1;
    }
    None
}

/// Strips `<think>...</think>` spans from streamed text. Once an opening tag
/// is seen with no matching close anywhere in the rest of the stream, every
/// later call returns an empty string — "unbalanced think discards the
/// remainder" falls out of that naturally, no extra bookkeeping needed.
pub struct ThinkFilter {
    in_think: bool,
}

impl Default for ThinkFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self { in_think: false }
    }

    pub fn filter(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        let mut rest = chunk;
        loop {
            if self.in_think {
                match rest.find("</think>") {
                    Some(end) => {
                        rest = &rest[end + "</think>".len()..];
                        self.in_think = false;
                    }
                    None => return out,
                }
            } else {
                match rest.find("<think>") {
                    Some(start) => {
                        out.push_str(&rest[..start]);
                        rest = &rest[start + "<think>".len()..];
                        self.in_think = true;
                    }
                    None => {
                        out.push_str(rest);
                        return out;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SkillSelection {
    skill_id: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    skill_intention: String,
    #[serde(default)]
    frustration_level: f32,
    #[serde(default)]
    frustration_reason: String,
}

enum SkillOutcome {
    Interpreted(String),
    Halted,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The final assistant-visible reply text for this turn.
    Reply(String),
    /// A UI/nexus skill rendered a structured view; the turn ends here with
    /// no further text reply (§4.3: "halt on ui/nexus skill type").
    Halted,
}

/// C8: the full per-turn dispatch sequence described in §4.3 — matcher call,
/// selection LLM call, skill invocation, interpretation LLM call (or a
/// `renderNexus` halt), wrapped in the guardrail retry loop.
pub struct DispatchMiddleware {
    llm: Arc<dyn LlmProvider>,
    matcher: Arc<SemanticMatcher>,
    skills: Arc<SkillRegistryClient>,
    templates: TemplateRenderer,
    model: String,
    max_tokens: u32,
}

impl DispatchMiddleware {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        matcher: Arc<SemanticMatcher>,
        skills: Arc<SkillRegistryClient>,
        templates: TemplateRenderer,
        model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            llm,
            matcher,
            skills,
            templates,
            model,
            max_tokens,
        }
    }

    /// Runs a single dispatch attempt over one LLM reply, buffering the
    /// full assembled text before emitting anything downstream. The
    /// guardrail marker, if present, is left intact in the returned text —
    /// the Conversation Manager decides whether to retry or strip it
    /// (§4.3 "Guardrails", §4.5 step 6). No `message/stream` event is sent
    /// from here; the caller emits once it has accepted the attempt.
    /// `chat_context` is the optional profile/summary/recent-messages block
    /// folded into any command-interpretation prompt this attempt triggers
    /// (§4.3 step 7); pass `""` when there is none.
    pub async fn run_once(&self, request: &ChatRequest, chat_context: &str, tx: &mpsc::Sender<Event>) -> Result<TurnOutcome, OrakleError> {
        let raw = self.send_streamed(request).await?;

        let mut think_filter = ThinkFilter::new();
        let visible = think_filter.filter(&raw);

        let mut scanner = DispatchScanner::new();
        let mut text_buf = String::new();
        for event in scanner.feed(&visible) {
            match event {
                ScanEvent::Text(t) => text_buf.push_str(&t),
                ScanEvent::Command(cmd) => match self.dispatch_skill(cmd.trim(), chat_context, tx).await? {
                    SkillOutcome::Halted => return Ok(TurnOutcome::Halted),
                    SkillOutcome::Interpreted(text) => text_buf.push_str(&text),
                },
            }
        }

        Ok(TurnOutcome::Reply(text_buf))
    }

    async fn dispatch_skill(&self, command_text: &str, chat_context: &str, tx: &mpsc::Sender<Event>) -> Result<SkillOutcome, OrakleError> {
        let matches = self.matcher.match_query(command_text).map_err(OrakleError::from)?;
        let candidates = self.render_candidates(&matches);

        let mut select_ctx = HashMap::new();
        select_ctx.insert("query", command_text.to_string());
        select_ctx.insert("candidates", candidates);
        let selection_prompt = self
            .templates
            .render(template::names::SKILL_SELECTION, &select_ctx)
            .map_err(|e| OrakleError::Fatal(e.to_string()))?;

        let selection_resp = self
            .llm
            .send(&self.one_shot_request(selection_prompt))
            .await
            .map_err(provider_err)?;
        let selection: SkillSelection = serde_json::from_str(extract_json(&selection_resp.content))
            .map_err(|e| OrakleError::LlmFormatError(e.to_string()))?;

        let _ = tx
            .send(Event::message_stream(
                selection.skill_intention.clone(),
                StreamFlags {
                    command: true,
                    ..Default::default()
                },
            ))
            .await;
        let _ = tx.send(Event::loading_start_skill(&selection.skill_id)).await;

        if selection.frustration_level > 0.0 {
            tracing::debug!(
                skill_id = %selection.skill_id,
                frustration_level = selection.frustration_level,
                reason = %selection.frustration_reason,
                "skill selection carried a frustration signal"
            );
        }

        self.matcher.record_usage(&selection.skill_id);
        let descriptor = self.matcher.descriptor(&selection.skill_id);

        let args: RunRequest = selection
            .parameters
            .as_object()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        let result = self
            .skills
            .invoke(&selection.skill_id, args)
            .await
            .map_err(OrakleError::from)?;
        let _ = tx.send(Event::loading_stop()).await;

        if matches!(descriptor.as_ref().map(|d| d.skill_type), Some(SkillType::Ui)) {
            let data = match result {
                RunResult::Json(v) => v,
                RunResult::Text(s) => serde_json::Value::String(s),
            };
            let component_path = descriptor
                .and_then(|d| d.ui)
                .and_then(|ui| ui.component)
                .unwrap_or_else(|| selection.skill_id.clone());
            let _ = tx
                .send(Event::render_nexus(component_path, data, command_text.to_string()))
                .await;
            return Ok(SkillOutcome::Halted);
        }

        let result_text = match result {
            RunResult::Text(s) => s,
            RunResult::Json(v) => v.to_string(),
        };

        let mut interp_ctx = HashMap::new();
        interp_ctx.insert("skill_id", selection.skill_id.clone());
        interp_ctx.insert("query", command_text.to_string());
        interp_ctx.insert("result", result_text);
        interp_ctx.insert("chat_context", chat_context.to_string());
        let interp_prompt = self
            .templates
            .render(template::names::COMMAND_INTERPRETATION, &interp_ctx)
            .map_err(|e| OrakleError::Fatal(e.to_string()))?;

        let interp_raw = self.send_streamed(&self.one_shot_request(interp_prompt)).await?;
        let mut filter = ThinkFilter::new();
        Ok(SkillOutcome::Interpreted(filter.filter(&interp_raw)))
    }

    /// Calls the LLM in streaming mode (§4.5 step 5) and collects every
    /// text delta into one string — the dispatch scanner and guardrail
    /// check both need the whole reply before anything is safe to show.
    async fn send_streamed(&self, request: &ChatRequest) -> Result<String, OrakleError> {
        let (stream_tx, mut stream_rx) = mpsc::channel(32);
        let llm = self.llm.clone();
        let req = request.clone();
        let handle = tokio::spawn(async move { llm.send_stream(&req, stream_tx).await });

        let mut raw = String::new();
        while let Some(event) = stream_rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => raw.push_str(&text),
                StreamEvent::Thinking { .. } | StreamEvent::Done { .. } => {}
                StreamEvent::Error { message } => return Err(OrakleError::Fatal(message)),
            }
        }
        handle
            .await
            .map_err(|e| OrakleError::Fatal(e.to_string()))?
            .map_err(provider_err)?;
        Ok(raw)
    }

    fn render_candidates(&self, matches: &[SkillMatch]) -> String {
        matches
            .iter()
            .map(|m| {
                let desc = self
                    .matcher
                    .descriptor(&m.skill_id)
                    .map(|d| d.description)
                    .unwrap_or_default();
                format!("- {} ({:.2}): {}", m.skill_id, m.score, desc)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn one_shot_request(&self, system: String) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            system,
            messages: Vec::new(),
            max_tokens: self.max_tokens,
            stream: false,
            thinking: None,
        }
    }
}

/// Finds the outermost `{...}` span in `text` and returns it, falling back
/// to the whole string — selection replies are occasionally wrapped in a
/// sentence or a markdown code fence around the JSON object.
fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

fn provider_err(e: ProviderError) -> OrakleError {
    match e {
        ProviderError::Http(err) => OrakleError::TransientNetwork(err.to_string()),
        ProviderError::RateLimited { retry_after_ms } => {
            OrakleError::TransientNetwork(format!("rate limited, retry after {retry_after_ms}ms"))
        }
        ProviderError::Unavailable(msg) => OrakleError::TransientNetwork(msg),
        ProviderError::Api { status, message } => OrakleError::Fatal(format!("LLM API error {status}: {message}")),
        ProviderError::Parse(msg) => OrakleError::LlmFormatError(msg),
        ProviderError::Cancelled => OrakleError::Fatal("LLM request cancelled".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_splits_plain_text_around_a_single_command() {
        let mut scanner = DispatchScanner::new();
        let events = scanner.feed("Let me check that.\n<<<ORAKLE\nweather in Paris\nORAKLE\nHere you go.");
        assert_eq!(events.len(), 3);
        matches!(events[0], ScanEvent::Text(_));
        match &events[1] {
            ScanEvent::Command(cmd) => assert_eq!(cmd.trim(), "weather in Paris"),
            other => panic!("expected Command, got {other:?}"),
        }
        match &events[2] {
            ScanEvent::Text(t) => assert_eq!(t, "Here you go."),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn scanner_accepts_semicolon_close_line() {
        let mut scanner = DispatchScanner::new();
        let events = scanner.feed("<<<ORAKLE\ndo the thing\nORAKLE;\ndone");
        let commands: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Command(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec!["do the thing\n".to_string()]);
    }

    #[test]
    fn scanner_handles_sentinel_split_across_chunks() {
        let mut scanner = DispatchScanner::new();
        let mut events = scanner.feed("hello <<<ORA");
        events.extend(scanner.feed("KLE\ncmd\nORAKLE\nbye"));
        let commands: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Command(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec!["cmd\n".to_string()]);
    }

    #[test]
    fn think_filter_strips_balanced_blocks() {
        let mut filter = ThinkFilter::new();
        let out = filter.filter("before <think>internal reasoning</think> after");
        assert_eq!(out, "before  after");
    }

    #[test]
    fn think_filter_discards_everything_after_an_unbalanced_open() {
        let mut filter = ThinkFilter::new();
        assert_eq!(filter.filter("visible <think>never closes"), "visible ");
        assert_eq!(filter.filter("more text that never surfaces"), "");
    }

    #[test]
    fn extract_json_finds_the_embedded_object() {
        let text = "Sure, here it is:\n```json\n{\"skill_id\": \"weather\"}\n```";
        assert_eq!(extract_json(text), "{\"skill_id\": \"weather\"}");
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    use orakle_memory::error::MemoryError;
    use orakle_memory::vector::Embedder as EmbedderTrait;
    use orakle_protocol::skill_wire::MatcherInfo;
    use orakle_skills::descriptor::SkillDescriptor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::provider::ChatResponse;

    /// Replies with one fixed string per call, in order, cycling the last
    /// entry if asked more times than scripted — enough to drive a full
    /// reply -> selection -> interpretation sequence deterministically.
    struct ScriptedLlm {
        replies: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&'static str>) -> Self {
            Self {
                replies,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = self.replies[n.min(self.replies.len() - 1)].to_string();
            Ok(ChatResponse {
                content,
                model: "scripted".to_string(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".to_string(),
            })
        }

        async fn send_stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<(), ProviderError> {
            let resp = self.send(req).await?;
            let _ = tx.send(StreamEvent::TextDelta { text: resp.content }).await;
            let _ = tx
                .send(StreamEvent::Done {
                    model: resp.model,
                    tokens_in: resp.tokens_in,
                    tokens_out: resp.tokens_out,
                    stop_reason: resp.stop_reason,
                })
                .await;
            Ok(())
        }
    }

    struct ConstantEmbedder;

    impl EmbedderTrait for ConstantEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn weather_descriptor() -> SkillDescriptor {
        SkillDescriptor {
            name: "weather".to_string(),
            description: "checks the current weather for a city".to_string(),
            matcher_info: MatcherInfo {
                keywords: vec!["weather".to_string()],
                domain_path: None,
            },
            parameters: Vec::new(),
            skill_type: SkillType::Regular,
            ui: None,
            embeddings_boost_factor: 1.0,
        }
    }

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: "you are a helpful assistant".to_string(),
            messages: Vec::new(),
            max_tokens: 256,
            stream: true,
            thinking: None,
        }
    }

    #[tokio::test]
    async fn run_once_returns_a_plain_reply_when_no_sentinel_is_present() {
        let llm: Arc<dyn LlmProvider> = Arc::new(ScriptedLlm::new(vec!["just a normal answer, no commands here"]));
        let embedder: Arc<dyn EmbedderTrait> = Arc::new(ConstantEmbedder);
        let matcher = Arc::new(SemanticMatcher::new(embedder, 0.0, 5));
        let skills = Arc::new(SkillRegistryClient::new(vec![], 1));
        let middleware = DispatchMiddleware::new(llm, matcher, skills, template::default_renderer(), "test-model".to_string(), 256);

        let (tx, _rx) = mpsc::channel(8);
        let outcome = middleware.run_once(&test_request(), "", &tx).await.unwrap();
        match outcome {
            TurnOutcome::Reply(text) => assert_eq!(text, "just a normal answer, no commands here"),
            TurnOutcome::Halted => panic!("expected a reply, got a halt"),
        }
    }

    #[tokio::test]
    async fn run_once_dispatches_a_matched_skill_and_interprets_its_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("12C and cloudy"))
            .mount(&server)
            .await;

        let llm: Arc<dyn LlmProvider> = Arc::new(ScriptedLlm::new(vec![
            "<<<ORAKLE\nweather in Paris\nORAKLE\n",
            r#"{"skill_id":"weather","parameters":{},"skill_intention":"checking the weather"}"#,
            "It's 12C and cloudy in Paris right now.",
        ]));
        let embedder: Arc<dyn EmbedderTrait> = Arc::new(ConstantEmbedder);
        let matcher = Arc::new(SemanticMatcher::new(embedder, 0.0, 5));
        matcher.register(weather_descriptor()).unwrap();
        let skills = Arc::new(SkillRegistryClient::new(vec![server.uri()], 5));
        let middleware = DispatchMiddleware::new(llm, matcher, skills, template::default_renderer(), "test-model".to_string(), 256);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = middleware.run_once(&test_request(), "", &tx).await.unwrap();
        match outcome {
            TurnOutcome::Reply(text) => assert_eq!(text, "It's 12C and cloudy in Paris right now."),
            TurnOutcome::Halted => panic!("expected a reply, got a halt"),
        }

        let mut saw_loading_start = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "signal" && event.event == "loading" {
                saw_loading_start = true;
            }
        }
        assert!(saw_loading_start);
    }

    #[tokio::test]
    async fn run_once_halts_on_a_ui_skill_instead_of_returning_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run/dashboard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"rows": []})))
            .mount(&server)
            .await;

        let llm: Arc<dyn LlmProvider> = Arc::new(ScriptedLlm::new(vec![
            "<<<ORAKLE\nshow my dashboard\nORAKLE\n",
            r#"{"skill_id":"dashboard","parameters":{},"skill_intention":"opening the dashboard"}"#,
        ]));
        let embedder: Arc<dyn EmbedderTrait> = Arc::new(ConstantEmbedder);
        let matcher = Arc::new(SemanticMatcher::new(embedder, 0.0, 5));
        matcher
            .register(SkillDescriptor {
                name: "dashboard".to_string(),
                description: "renders the user's dashboard".to_string(),
                matcher_info: MatcherInfo {
                    keywords: vec![],
                    domain_path: None,
                },
                parameters: Vec::new(),
                skill_type: SkillType::Ui,
                ui: None,
                embeddings_boost_factor: 1.0,
            })
            .unwrap();
        let skills = Arc::new(SkillRegistryClient::new(vec![server.uri()], 5));
        let middleware = DispatchMiddleware::new(llm, matcher, skills, template::default_renderer(), "test-model".to_string(), 256);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = middleware.run_once(&test_request(), "", &tx).await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Halted));

        let mut saw_render_nexus = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "ui" && event.event == "renderNexus" {
                saw_render_nexus = true;
            }
        }
        assert!(saw_render_nexus);
    }
}
