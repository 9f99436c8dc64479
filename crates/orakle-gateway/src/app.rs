use std::sync::{Arc, Mutex};

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use rusqlite::Connection;

use orakle_core::config::OrakleConfig;
use orakle_core::error::OrakleError;
use orakle_engine::conversation::{ConversationManager, LlmAssimilator, LlmSynthesizer};
use orakle_engine::middleware::DispatchMiddleware;
use orakle_engine::provider::LlmProvider;
use orakle_engine::template::{self, TemplateRenderer};
use orakle_engine::workers::spawn_summary_worker;
use orakle_engine::{active_model, build_provider};
use orakle_memory::chat_memory::ChatMemory;
use orakle_memory::db;
use orakle_memory::green::GreenMemoryEngine;
use orakle_memory::vector::{Embedder, FastEmbedEmbedder};
use orakle_skills::matcher::SemanticMatcher;
use orakle_skills::registry_client::SkillRegistryClient;

/// The teacher's per-request budget lives in `AgentRuntime`'s model
/// catalogue; there is no equivalent knob in this engine's config, so the
/// gateway just fixes one reply budget for every turn.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Central shared state — passed as `Arc<AppState>` to every Axum handler.
/// One `ConversationManager` per session key, built and cached lazily on
/// first use; each owns its own on-disk context database (§6: "one
/// relational database file exists per context").
pub struct AppState {
    pub config: OrakleConfig,
    pub llm: Arc<dyn LlmProvider>,
    pub model: String,
    pub matcher: Arc<SemanticMatcher>,
    pub skills: Arc<SkillRegistryClient>,
    pub templates: TemplateRenderer,
    pub embedder: Arc<dyn Embedder>,
    sessions: DashMap<String, Arc<ConversationManager>>,
}

impl AppState {
    pub async fn new(config: OrakleConfig) -> Result<Self, OrakleError> {
        let llm = build_provider(&config.llm)?;
        let model = active_model(&config.llm)?;

        let embedder: Arc<dyn Embedder> = Arc::new(
            FastEmbedEmbedder::new(&config.skills.matcher.embedding_model).map_err(OrakleError::from)?,
        );
        let matcher = Arc::new(SemanticMatcher::new(
            embedder.clone(),
            config.skills.matcher.similarity_threshold,
            config.skills.matcher.top_k,
        ));
        let skills = Arc::new(SkillRegistryClient::new(
            config.skills.servers.clone(),
            config.skills.timeout_secs,
        ));

        // Best-effort: an unreachable skill registry at startup just means
        // the matcher starts empty, not a fatal gateway error (§4.2).
        match skills.capabilities().await {
            Ok(descriptors) => {
                for descriptor in descriptors {
                    if let Err(e) = matcher.register(descriptor) {
                        tracing::warn!(error = %e, "failed to register a skill descriptor at startup");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "no skill servers reachable at startup, matcher starts empty"),
        }

        Ok(Self {
            config,
            llm,
            model,
            matcher,
            skills,
            templates: template::default_renderer(),
            embedder,
            sessions: DashMap::new(),
        })
    }

    /// Returns the Conversation Manager for a session key, building and
    /// caching one on first use.
    pub fn session(&self, session_key: &str) -> Result<Arc<ConversationManager>, OrakleError> {
        if let Some(existing) = self.sessions.get(session_key) {
            return Ok(existing.clone());
        }

        let conn = self.open_context_db(session_key)?;
        let context_window = self.config.llm.context_window;

        let memory = Arc::new(
            GreenMemoryEngine::new(conn.clone(), self.embedder.clone(), self.config.memory.clone(), context_window)
                .map_err(OrakleError::from)?,
        );
        let chat_memory = Arc::new(ChatMemory::new(conn));

        let dispatch = DispatchMiddleware::new(
            self.llm.clone(),
            self.matcher.clone(),
            self.skills.clone(),
            self.templates.clone(),
            self.model.clone(),
            DEFAULT_MAX_TOKENS,
        );
        let synthesizer = Arc::new(LlmSynthesizer::new(self.llm.clone(), self.model.clone()));
        let assimilator = Arc::new(LlmAssimilator::new(self.llm.clone(), self.model.clone()));

        let summary_slot = Arc::new(Mutex::new(None));
        let summary_tx = spawn_summary_worker(self.llm.clone(), self.model.clone(), context_window, summary_slot.clone());

        let conversation = Arc::new(ConversationManager::new(
            dispatch,
            chat_memory,
            memory,
            synthesizer,
            assimilator,
            None,
            summary_slot,
            summary_tx,
            self.config.conversation.clone(),
            self.model.clone(),
            DEFAULT_MAX_TOKENS,
            context_window,
        ));

        self.sessions.insert(session_key.to_string(), conversation.clone());
        Ok(conversation)
    }

    fn open_context_db(&self, session_key: &str) -> Result<Arc<Mutex<Connection>>, OrakleError> {
        std::fs::create_dir_all(&self.config.database.dir)?;
        let path = format!("{}/{}.db", self.config.database.dir, sanitize_session_key(session_key));
        let conn = Connection::open(path).map_err(|e| OrakleError::Database(e.to_string()))?;
        db::init_db(&conn).map_err(|e| OrakleError::Database(e.to_string()))?;
        Ok(Arc::new(Mutex::new(conn)))
    }
}

/// Session keys arrive from client-controlled JSON; this keeps them safe as
/// a filename component instead of validating and rejecting.
fn sanitize_session_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
