use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{info, warn};

use orakle_core::config::MemoryConfig;
use orakle_core::lexicon::is_substantive_query;
use orakle_core::types::{MemoryId, MemoryKind, MemoryStatus, MessageId};

use crate::chat_memory::ChatMemory;
use crate::db;
use crate::error::MemoryError;
use crate::normalize::normalize;
use crate::types::{metadata_keys, Memory, ScoredMemory};
use crate::vector::VectorStore;

/// One of the four outcomes an assimilation call may return (§4.4 turn
/// ingestion table). `past_memory_ids`/`duplicates` may accompany either
/// variant and are always processed in the fixed order: past first,
/// primary action second, duplicates last.
#[derive(Debug, Clone)]
pub enum AssimilationAction {
    Ignore,
    Reinforce {
        memory_id: MemoryId,
        new_text: Option<String>,
    },
    Create {
        target: MemoryKind,
        topic: String,
        text: String,
    },
}

#[derive(Debug, Clone)]
pub struct AssimilationDecision {
    pub action: AssimilationAction,
    pub past_memory_ids: Vec<MemoryId>,
    pub duplicates: Vec<MemoryId>,
}

impl AssimilationDecision {
    pub fn new(action: AssimilationAction) -> Self {
        Self {
            action,
            past_memory_ids: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn with_past(mut self, ids: Vec<MemoryId>) -> Self {
        self.past_memory_ids = ids;
        self
    }

    pub fn with_duplicates(mut self, ids: Vec<MemoryId>) -> Self {
        self.duplicates = ids;
        self
    }
}

/// The LLM-driven half of assimilation and narrative generation is injected
/// rather than called directly — `orakle-memory` must not depend on
/// `orakle-engine`'s LLM adapter, which itself depends on this crate.
pub trait MemoryAssimilator: Send + Sync {
    fn decide(&self, turn_context: &str, candidates: &[Memory]) -> Result<AssimilationDecision, MemoryError>;
}

pub trait MemorySynthesizer: Send + Sync {
    fn synthesize(&self, prompt: &str) -> Result<String, MemoryError>;
}

/// C6: extract, assimilate, reinforce, decay, and retrieve long-term
/// memories (the GREEN algorithm, §4.4). SQLite is authoritative; the
/// vector store is a derived, rebuildable projection (§3 Ownership, §9).
pub struct GreenMemoryEngine {
    conn: Arc<Mutex<Connection>>,
    vector_store: VectorStore<Memory>,
    embedder: Arc<dyn crate::vector::Embedder>,
    config: MemoryConfig,
    context_window: u32,
    decay_in_flight: AtomicBool,
}

impl GreenMemoryEngine {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        embedder: Arc<dyn crate::vector::Embedder>,
        config: MemoryConfig,
        context_window: u32,
    ) -> Result<Self, MemoryError> {
        let vector_store = VectorStore::new(conn.clone(), "user_profile_memories", embedder.clone())?;
        let engine = Self {
            conn,
            vector_store,
            embedder,
            config,
            context_window,
            decay_in_flight: AtomicBool::new(false),
        };
        engine.reconcile()?;
        Ok(engine)
    }

    /// Startup reconciliation (§4.4 storage model, §4.4 "Reconciliation").
    /// Rebuilds the vector index from SQLite on row-count mismatch or an
    /// explicit `vector_db_needs_reset` flag, then clears the flag.
    pub fn reconcile(&self) -> Result<(), MemoryError> {
        let needs_reset = {
            let db = self.conn.lock().unwrap();
            let flag = db::get_metadata(&db, metadata_keys::VECTOR_DB_NEEDS_RESET)?;

            // Manual reset: memories table is empty but a processing
            // timestamp is still set.
            let row_count: i64 = db.query_row("SELECT COUNT(*) FROM user_memories", [], |r| r.get(0))?;
            let has_timestamp = db::get_metadata(&db, metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP)?.is_some();
            if row_count == 0 && has_timestamp {
                db::delete_metadata(&db, metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP)?;
                db::set_metadata(&db, metadata_keys::VECTOR_DB_NEEDS_RESET, "true")?;
            }

            flag.as_deref() == Some("true")
        };

        let sqlite_count = self.sqlite_count()?;
        let vector_count = self.vector_store.count()?;

        if needs_reset || sqlite_count != vector_count {
            warn!(
                sqlite_count,
                vector_count, needs_reset, "rebuilding vector index from relational store"
            );
            self.rebuild_vector_index()?;
            let db = self.conn.lock().unwrap();
            db::set_metadata(&db, metadata_keys::VECTOR_DB_NEEDS_RESET, "false")?;
        }
        Ok(())
    }

    fn sqlite_count(&self) -> Result<usize, MemoryError> {
        let db = self.conn.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM user_memories", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn rebuild_vector_index(&self) -> Result<(), MemoryError> {
        self.vector_store.reset()?;
        let memories = self.all_memories()?;
        for memory in &memories {
            self.vector_store.add(memory.id.as_str(), &normalize(&memory.text), memory)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool, MemoryError> {
        Ok(self.sqlite_count()? == 0)
    }

    // ---- top-k policy (§4.4 "Top-k policy") ----

    pub fn top_k_retrieval(&self) -> usize {
        piecewise_top_k(self.context_window, 5, 10, 20)
    }

    pub fn top_k_profile(&self) -> usize {
        piecewise_top_k(self.context_window, 25, 50, 75)
    }

    pub fn top_k_assimilation(&self) -> usize {
        piecewise_top_k(self.context_window, 20, 35, 60)
    }

    // ---- retrieval (§4.4 "Retrieval for live conversation") ----

    pub fn get_relevant_memories(
        &self,
        query: &str,
        exclude_ids: &[MemoryId],
    ) -> Result<Vec<ScoredMemory>, MemoryError> {
        if !is_substantive_query(query) {
            info!("query is not substantive, skipping contextual memory retrieval");
            return Ok(Vec::new());
        }

        let relevant_topics = self.relevant_topics_for_context(query)?;
        let top_k = self.top_k_retrieval();
        let exclude: Vec<String> = exclude_ids.iter().map(|id| id.as_str().to_string()).collect();
        let candidates = self
            .vector_store
            .search_with_scores(&normalize(query), top_k * 3, &exclude)?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|(memory, distance)| self.score_candidate(memory, distance, &relevant_topics))
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn score_candidate(&self, memory: Memory, distance: f32, relevant_topics: &[String]) -> ScoredMemory {
        let mut relevance = memory.relevance;
        if memory.kind == MemoryKind::Key || relevant_topics.contains(&memory.topic) {
            relevance *= self.config.key_memory_boost;
        }

        // Unit-normalized embeddings: cosine similarity = 1 - squared_L2/2.
        let semantic_score = 1.0 - (distance / 2.0);
        let w = self.config.relevance_weight;
        let base_score = semantic_score * (1.0 - w) + relevance * w;

        let hours_since_update = (chrono::Utc::now() - memory.last_updated).num_seconds() as f32 / 3600.0;
        let recency_boost = 1.0
            + (self.config.max_recency_boost - 1.0)
                * (-self.config.recency_decay_rate * hours_since_update).exp();

        let mut combined = base_score * recency_boost;
        if memory.status == MemoryStatus::Past {
            combined *= self.config.past_memory_penalty;
        }

        let display_text = if memory.status == MemoryStatus::Past {
            format!("PAST MEMORY DON'T CONSIDER THIS A CURRENT EVENT: \"{}\"", memory.text)
        } else {
            memory.text.clone()
        };

        ScoredMemory {
            memory,
            score: combined,
            display_text,
        }
    }

    /// Every distinct memory topic whose embedding is close to the query —
    /// used to boost relevance of same-topic memories even when they don't
    /// directly match (§4.4 step 3 "relevant_topics"). Embeds and compares
    /// each topic string directly against the query, not a proxy over
    /// memory content, and is not capped to a fixed candidate count.
    fn relevant_topics_for_context(&self, query: &str) -> Result<Vec<String>, MemoryError> {
        let all_topics = self.get_all_topics()?;
        if all_topics.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = unit_normalize(self.embedder.embed(query)?);
        let relevant: Vec<String> = all_topics
            .into_iter()
            .filter_map(|topic| {
                let topic_vec = unit_normalize(self.embedder.embed(&topic).ok()?);
                let similarity = cosine_similarity(&query_vec, &topic_vec);
                (similarity > 0.3).then_some(topic)
            })
            .collect();
        Ok(relevant)
    }

    pub fn get_key_memories(&self, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, type, topic, text, relevance, status, created_at, last_updated,
                    source_message_ids, metadata
             FROM user_memories WHERE type = 'key' AND status = 'current'
             ORDER BY relevance DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_all_topics(&self) -> Result<Vec<String>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare("SELECT DISTINCT topic FROM user_memories")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn all_memories(&self) -> Result<Vec<Memory>, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, type, topic, text, relevance, status, created_at, last_updated,
                    source_message_ids, metadata
             FROM user_memories",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---- narratives (§4.4 "Narratives") ----

    pub fn generate_user_profile_summary(
        &self,
        synthesizer: &dyn MemorySynthesizer,
    ) -> Result<String, MemoryError> {
        let key_memories: Vec<Memory> = self
            .get_key_memories(self.top_k_profile())?
            .into_iter()
            .filter(|m| m.relevance >= self.config.min_key_memory_relevance)
            .collect();
        if key_memories.is_empty() {
            return Ok(String::new());
        }
        let prompt = format!(
            "Synthesize a coherent paragraph describing this user, prioritizing \
             higher-relevance facts when they conflict.\n\n{}",
            render_memory_list(&key_memories)
        );
        synthesizer.synthesize(&prompt)
    }

    pub fn generate_recent_memories_summary(
        &self,
        synthesizer: &dyn MemorySynthesizer,
    ) -> Result<String, MemoryError> {
        let db = self.conn.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, type, topic, text, relevance, status, created_at, last_updated,
                    source_message_ids, metadata
             FROM user_memories WHERE status = 'current'
             ORDER BY last_updated DESC LIMIT ?1",
        )?;
        let top_k = self.top_k_profile();
        let rows = stmt.query_map([top_k as i64], row_to_memory)?;
        let recent: Vec<Memory> = rows.filter_map(|r| r.ok()).collect();
        drop(db);
        if recent.is_empty() {
            return Ok(String::new());
        }
        let prompt = format!(
            "Summarize what has recently changed about this user.\n\n{}",
            render_memory_list(&recent)
        );
        synthesizer.synthesize(&prompt)
    }

    // ---- turn ingestion & assimilation (§4.4 "Turn ingestion") ----

    /// Processes every complete (user, assistant) turn logged since
    /// `profile_last_processed_timestamp`, advancing the timestamp before
    /// each turn so a failing turn is skipped rather than retried forever
    /// (§5 ordering guarantee c).
    pub fn process_new_messages_for_update(
        &self,
        chat_memory: &ChatMemory,
        assimilator: &dyn MemoryAssimilator,
    ) -> Result<(), MemoryError> {
        let last_timestamp = {
            let db = self.conn.lock().unwrap();
            db::get_metadata(&db, metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP)?
        };
        let new_messages = chat_memory.since(last_timestamp.as_deref())?;
        if new_messages.is_empty() {
            return Ok(());
        }

        let mut turns = Vec::new();
        for i in 1..new_messages.len() {
            if new_messages[i].role == orakle_core::types::Role::Assistant
                && new_messages[i - 1].role == orakle_core::types::Role::User
            {
                turns.push((new_messages[i - 1].clone(), new_messages[i].clone()));
            }
        }

        if turns.is_empty() {
            let db = self.conn.lock().unwrap();
            db::set_metadata(
                &db,
                metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP,
                &new_messages.last().unwrap().timestamp.to_rfc3339(),
            )?;
            return Ok(());
        }

        let extraction_window = self.config.extraction_context_turns as usize;
        let mut batch: Vec<Memory> = Vec::new();

        for i in 0..turns.len() {
            let (_, assistant_msg) = &turns[i];
            {
                let db = self.conn.lock().unwrap();
                db::set_metadata(
                    &db,
                    metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP,
                    &assistant_msg.timestamp.to_rfc3339(),
                )?;
            }

            let start = i.saturating_sub(extraction_window);
            let window = &turns[start..=i];
            let turn_context = render_turn_context(window);
            let query = &turns[i].0.content;

            match self.assimilate_one(&turn_context, query, assimilator, &batch) {
                Ok(Some(memory)) => {
                    if let Some(existing) = batch.iter_mut().find(|m| m.id == memory.id) {
                        *existing = memory;
                    } else {
                        batch.push(memory);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to assimilate turn, skipping");
                }
            }
        }

        Ok(())
    }

    fn assimilate_one(
        &self,
        turn_context: &str,
        query: &str,
        assimilator: &dyn MemoryAssimilator,
        batch: &[Memory],
    ) -> Result<Option<Memory>, MemoryError> {
        let top_k = self.top_k_assimilation();
        let exclude: Vec<String> = Vec::new();
        let mut candidates: Vec<Memory> = self
            .vector_store
            .search_with_scores(&normalize(query), top_k, &exclude)?
            .into_iter()
            .map(|(memory, _)| memory)
            .collect();
        for memory in batch {
            if !candidates.iter().any(|m| m.id == memory.id) {
                candidates.push(memory.clone());
            }
        }

        let decision = assimilator.decide(turn_context, &candidates)?;
        self.apply_decision(decision)
    }

    /// Assimilation order within a turn (§4.4): past ids first, then the
    /// primary action, then duplicate consolidation.
    pub fn apply_decision(&self, decision: AssimilationDecision) -> Result<Option<Memory>, MemoryError> {
        if !decision.past_memory_ids.is_empty() {
            self.mark_past(&decision.past_memory_ids)?;
        }

        let result = match decision.action {
            AssimilationAction::Ignore => None,
            AssimilationAction::Reinforce { memory_id, new_text } => {
                Some(self.reinforce(&memory_id, new_text.as_deref())?)
            }
            AssimilationAction::Create { target, topic, text } => {
                Some(self.create(target, &topic, &text, Vec::new())?)
            }
        };

        if !decision.duplicates.is_empty() {
            if let Some(ref kept) = result {
                return Ok(Some(self.consolidate_duplicates(&kept.id, &decision.duplicates)?));
            }
        }

        Ok(result)
    }

    pub fn create(
        &self,
        kind: MemoryKind,
        topic: &str,
        text: &str,
        source_message_ids: Vec<MessageId>,
    ) -> Result<Memory, MemoryError> {
        let mut memory = Memory::new(kind, topic, text);
        memory.source_message_ids = source_message_ids;
        self.persist_new(&memory)?;
        self.vector_store.add(memory.id.as_str(), &normalize(&memory.text), &memory)?;
        Ok(memory)
    }

    fn persist_new(&self, memory: &Memory) -> Result<(), MemoryError> {
        let db = self.conn.lock().unwrap();
        db.execute(
            "INSERT INTO user_memories
             (id, type, topic, text, relevance, status, created_at, last_updated,
              source_message_ids, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                memory.id.as_str(),
                memory.kind.to_string(),
                memory.topic,
                memory.text,
                memory.relevance,
                memory.status.to_string(),
                memory.created_at.to_rfc3339(),
                memory.last_updated.to_rfc3339(),
                serde_json::to_string(&memory.source_message_ids)?,
                serde_json::to_string(&memory.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn reinforce(&self, id: &MemoryId, new_text: Option<&str>) -> Result<Memory, MemoryError> {
        let mut memory = self.get(id)?;
        memory.relevance = (memory.relevance + self.config.reinforce_increment).min(self.config.relevance_cap);
        memory.last_updated = chrono::Utc::now();
        if let Some(text) = new_text {
            memory.text = text.to_string();
        }

        let db = self.conn.lock().unwrap();
        db.execute(
            "UPDATE user_memories SET text = ?1, relevance = ?2, last_updated = ?3 WHERE id = ?4",
            rusqlite::params![memory.text, memory.relevance, memory.last_updated.to_rfc3339(), id.as_str()],
        )?;
        drop(db);

        self.vector_store.add(id.as_str(), &normalize(&memory.text), &memory)?;
        Ok(memory)
    }

    pub fn mark_past(&self, ids: &[MemoryId]) -> Result<(), MemoryError> {
        for id in ids {
            let mut memory = self.get(id)?;
            memory.status = MemoryStatus::Past;
            let db = self.conn.lock().unwrap();
            db.execute(
                "UPDATE user_memories SET status = 'past' WHERE id = ?1",
                [id.as_str()],
            )?;
            drop(db);
            self.vector_store.add(id.as_str(), &normalize(&memory.text), &memory)?;
        }
        Ok(())
    }

    /// Sums the relevance of every duplicate into `keep_id`, then deletes
    /// the duplicates from both stores (§4.4, §8 testable property).
    pub fn consolidate_duplicates(&self, keep_id: &MemoryId, duplicate_ids: &[MemoryId]) -> Result<Memory, MemoryError> {
        let mut kept = self.get(keep_id)?;
        for dup_id in duplicate_ids {
            let dup = self.get(dup_id)?;
            kept.relevance += dup.relevance;
            self.delete(dup_id)?;
        }
        kept.relevance = kept.relevance.min(self.config.relevance_cap);
        kept.last_updated = chrono::Utc::now();

        let db = self.conn.lock().unwrap();
        db.execute(
            "UPDATE user_memories SET relevance = ?1, last_updated = ?2 WHERE id = ?3",
            rusqlite::params![kept.relevance, kept.last_updated.to_rfc3339(), keep_id.as_str()],
        )?;
        drop(db);
        self.vector_store.add(keep_id.as_str(), &normalize(&kept.text), &kept)?;
        Ok(kept)
    }

    pub fn delete(&self, id: &MemoryId) -> Result<(), MemoryError> {
        let db = self.conn.lock().unwrap();
        db.execute("DELETE FROM user_memories WHERE id = ?1", [id.as_str()])?;
        drop(db);
        self.vector_store.delete(id.as_str())?;
        Ok(())
    }

    pub fn get(&self, id: &MemoryId) -> Result<Memory, MemoryError> {
        let db = self.conn.lock().unwrap();
        db.query_row(
            "SELECT id, type, topic, text, relevance, status, created_at, last_updated,
                    source_message_ids, metadata
             FROM user_memories WHERE id = ?1",
            [id.as_str()],
            row_to_memory,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MemoryError::NotFound { id: id.as_str().to_string() },
            other => MemoryError::Database(other),
        })
    }

    // ---- decay (§4.4 "Relevance decay") ----

    pub fn turn_counter(&self) -> Result<u32, MemoryError> {
        let db = self.conn.lock().unwrap();
        let value = db::get_metadata(&db, metadata_keys::PROFILE_DECAY_TURN_COUNTER)?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn save_turn_counter(&self, count: u32) -> Result<(), MemoryError> {
        let db = self.conn.lock().unwrap();
        db::set_metadata(&db, metadata_keys::PROFILE_DECAY_TURN_COUNTER, &count.to_string())?;
        Ok(())
    }

    /// Advances the turn counter and runs decay once `decay_interval_turns`
    /// is reached, resetting the counter. Concurrent calls are coalesced
    /// via a single-flight flag (§4.4).
    pub fn maybe_decay(&self) -> Result<bool, MemoryError> {
        let count = self.turn_counter()? + 1;
        if count < self.config.decay_interval_turns {
            self.save_turn_counter(count)?;
            return Ok(false);
        }
        self.save_turn_counter(0)?;
        self.decay_all()?;
        Ok(true)
    }

    pub fn decay_all(&self) -> Result<(), MemoryError> {
        if self
            .decay_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("decay already in flight, skipping coalesced request");
            return Ok(());
        }
        let result = self.decay_all_inner();
        self.decay_in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn decay_all_inner(&self) -> Result<(), MemoryError> {
        let memories = self.all_memories()?;
        let current_factor = self.config.decay_factor;
        let past_factor = self.config.decay_factor.powi(4);
        let db = self.conn.lock().unwrap();
        for memory in &memories {
            let factor = if memory.status == MemoryStatus::Past { past_factor } else { current_factor };
            db.execute(
                "UPDATE user_memories SET relevance = relevance * ?1 WHERE id = ?2",
                rusqlite::params![factor, memory.id.as_str()],
            )?;
        }
        Ok(())
    }
}

fn unit_normalize(v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v;
    }
    v.into_iter().map(|x| x / norm).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn piecewise_top_k(context_window: u32, small: usize, medium: usize, large: usize) -> usize {
    if context_window <= 8192 {
        small
    } else if context_window <= 32768 {
        medium
    } else {
        large
    }
}

fn render_memory_list(memories: &[Memory]) -> String {
    memories
        .iter()
        .map(|m| format!("- [{}] {} (relevance {:.2})", m.topic, m.text, m.relevance))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_turn_context(turns: &[(crate::types::Message, crate::types::Message)]) -> String {
    turns
        .iter()
        .map(|(user, assistant)| format!("User: {}\nAssistant: {}", user.content, assistant.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;
    let source_ids_str: String = row.get(8)?;
    let metadata_str: String = row.get(9)?;

    let source_message_ids: Vec<i64> = serde_json::from_str(&source_ids_str).unwrap_or_default();

    Ok(Memory {
        id: MemoryId(row.get(0)?),
        kind: kind_str.parse().unwrap_or(MemoryKind::Extended),
        topic: row.get(2)?,
        text: row.get(3)?,
        relevance: row.get(4)?,
        status: status_str.parse().unwrap_or(MemoryStatus::Current),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_str)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        last_updated: chrono::DateTime::parse_from_rfc3339(&updated_str)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        source_message_ids: source_message_ids.into_iter().map(MessageId).collect(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Embedder;
    use orakle_core::types::Role;

    /// Deterministic bag-of-words embedder: no ONNX runtime or network
    /// access, just enough signal that shared-word texts score closer than
    /// unrelated ones.
    struct FakeEmbedder;

    impl Embedder for FakeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            const DIM: usize = 32;
            let mut v = vec![0.0f32; DIM];
            for word in text.split_whitespace() {
                let mut hash: u64 = 1469598103934665603;
                for b in word.bytes() {
                    hash ^= b as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
                v[(hash as usize) % DIM] += 1.0;
            }
            if v.iter().all(|x| *x == 0.0) {
                v[0] = 1.0;
            }
            Ok(v)
        }
    }

    fn test_engine() -> GreenMemoryEngine {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        GreenMemoryEngine::new(conn, Arc::new(FakeEmbedder), MemoryConfig::default(), 128_000).unwrap()
    }

    #[test]
    fn reconcile_is_a_no_op_on_a_fresh_store() {
        let engine = test_engine();
        assert!(engine.is_empty().unwrap());
    }

    #[test]
    fn create_then_retrieve_finds_the_memory() {
        let engine = test_engine();
        engine
            .create(MemoryKind::Key, "pets", "the user has a dog named Rex", Vec::new())
            .unwrap();

        let results = engine
            .get_relevant_memories("tell me about my dog Rex and his favorite walks", &[])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].display_text.contains("Rex"));
    }

    #[test]
    fn non_substantive_query_returns_no_memories() {
        let engine = test_engine();
        engine.create(MemoryKind::Extended, "misc", "likes tea", Vec::new()).unwrap();
        let results = engine.get_relevant_memories("ok thanks", &[]).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn past_memories_get_the_warning_prefix_and_lower_score() {
        let engine = test_engine();
        let memory = engine
            .create(MemoryKind::Extended, "job", "the user works as a teacher", Vec::new())
            .unwrap();
        engine.mark_past(&[memory.id.clone()]).unwrap();

        let results = engine
            .get_relevant_memories("what is my job as a teacher these days", &[])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].display_text.starts_with("PAST MEMORY"));
    }

    #[test]
    fn reinforce_increments_relevance_up_to_the_cap() {
        let engine = test_engine();
        let memory = engine.create(MemoryKind::Key, "job", "works as a teacher", Vec::new()).unwrap();
        assert_eq!(memory.relevance, 1.0);

        let reinforced = engine.reinforce(&memory.id, None).unwrap();
        assert!((reinforced.relevance - 1.1).abs() < 1e-5);
    }

    #[test]
    fn decay_reduces_current_and_past_relevance_differently() {
        let engine = test_engine();
        let current = engine.create(MemoryKind::Extended, "a", "likes coffee", Vec::new()).unwrap();
        let past = engine.create(MemoryKind::Extended, "b", "used to live in Berlin", Vec::new()).unwrap();
        engine.mark_past(&[past.id.clone()]).unwrap();

        engine.decay_all().unwrap();

        let current_after = engine.get(&current.id).unwrap();
        let past_after = engine.get(&past.id).unwrap();
        assert!((current_after.relevance - 0.998).abs() < 1e-4);
        assert!((past_after.relevance - 0.998f32.powi(4)).abs() < 1e-4);
    }

    #[test]
    fn consolidate_duplicates_sums_relevance_and_deletes_duplicates() {
        let engine = test_engine();
        let keep = engine.create(MemoryKind::Extended, "pets", "has a cat", Vec::new()).unwrap();
        let dup = engine.create(MemoryKind::Extended, "pets", "owns a cat", Vec::new()).unwrap();

        let merged = engine.consolidate_duplicates(&keep.id, &[dup.id.clone()]).unwrap();
        assert!((merged.relevance - 2.0).abs() < 1e-5);
        assert!(engine.get(&dup.id).is_err());
    }

    #[test]
    fn reconcile_rebuilds_vector_index_after_a_flag_reset() {
        let engine = test_engine();
        engine.create(MemoryKind::Extended, "pets", "has a cat", Vec::new()).unwrap();

        {
            let db = engine.conn.lock().unwrap();
            db::set_metadata(&db, metadata_keys::VECTOR_DB_NEEDS_RESET, "true").unwrap();
        }
        engine.reconcile().unwrap();
        assert_eq!(engine.vector_store.count().unwrap(), 1);
    }

    struct ScriptedAssimilator(Mutex<Vec<AssimilationDecision>>);

    impl MemoryAssimilator for ScriptedAssimilator {
        fn decide(&self, _turn_context: &str, _candidates: &[Memory]) -> Result<AssimilationDecision, MemoryError> {
            Ok(self.0.lock().unwrap().remove(0))
        }
    }

    #[test]
    fn process_new_messages_creates_a_memory_and_advances_the_timestamp() {
        let engine = test_engine();
        let conn = engine.conn.clone();
        let chat_memory = ChatMemory::new(conn);
        chat_memory.append(Role::User, "I just moved to Austin", 6, serde_json::json!({})).unwrap();
        chat_memory
            .append(Role::Assistant, "Nice, welcome to Austin!", 6, serde_json::json!({}))
            .unwrap();

        let assimilator = ScriptedAssimilator(Mutex::new(vec![AssimilationDecision::new(
            AssimilationAction::Create {
                target: MemoryKind::Extended,
                topic: "location".to_string(),
                text: "the user moved to Austin".to_string(),
            },
        )]));

        engine.process_new_messages_for_update(&chat_memory, &assimilator).unwrap();

        let topics = engine.get_all_topics().unwrap();
        assert_eq!(topics, vec!["location".to_string()]);

        let db = engine.conn.lock().unwrap();
        let ts = db::get_metadata(&db, metadata_keys::PROFILE_LAST_PROCESSED_TIMESTAMP).unwrap();
        assert!(ts.is_some());
    }
}
