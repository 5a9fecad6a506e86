//! One persona's analysis cycle: bootstrap, batch, prompt, repair, filter,
//! merge.

use serde_json::{Map, Value};

use super::{Collaborators, CycleSettings};
use crate::batch::{estimate_tokens, Batch, TokenBudgetBatcher};
use crate::conversation::render_for;
use crate::memory::schema::RECENT_CAP;
use crate::memory::{MemoryRecord, MemoryStore, FEEDBACK_SCHEMA, PERSONA_SCHEMA};
use crate::prompts::BatchPrompt;
use crate::repair;
use crate::types::{InteractionBlock, Persona};

/// Fields the initial profile fills in.
const PROFILE_FIELDS: &[&str] = &[
    "personality_summary",
    "personality",
    "relational_dynamics",
    "core_values",
    "emotional_patterns",
];

/// Dated first-person entries subject to the content filter.
const DATED_FIELDS: &[&str] = &["recent_reflections", "plans", "compliments"];

const FIRST_PERSON: &[&str] = &[
    "i", "i'm", "i've", "i'll", "i'd", "me", "my", "mine", "myself", "we", "us", "our",
    "eu", "mim", "comigo", "meu", "minha", "meus", "minhas", "nós", "nos", "nosso", "nossa",
    "conosco", "connosco",
];

/// Leading subjects that mark an entry as narrated about someone else.
const THIRD_PERSON_SUBJECTS: &[&str] = &["ele", "ela", "eles", "elas", "he", "she", "they"];

/// Words that look like first-person preterites but are not verbs.
const NOT_VERBS: &[&str] = &["aqui", "ali", "daqui", "dali", "assim"];

/// Shorter counterpart messages are too generic to count as quotes.
const MIN_QUOTE_WORDS: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub batches: usize,
    pub analyzed: usize,
    pub cached: usize,
    pub failed: usize,
    /// Entries dropped by the content filter.
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub persona: Persona,
    /// Updated durable memory.
    pub memory: MemoryRecord,
    /// Union of this cycle's batch extractions.
    pub feedback: MemoryRecord,
    pub stats: CycleStats,
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('’', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Portuguese drops the subject pronoun, so a first-person verb form
/// ("fiquei", "senti", "jantámos") is enough to mark the speaker.
fn is_first_person_verb(word: &str, leading: bool) -> bool {
    let len = word.chars().count();
    if NOT_VERBS.contains(&word) {
        return false;
    }
    (len >= 4 && word.ends_with("ei"))
        || (leading && len >= 4 && word.ends_with('i'))
        || (leading && len >= 5 && word.ends_with("mos"))
}

/// Speaks as "I", does not open with a third-person subject, and never
/// refers to the persona by name.
fn is_first_person(text: &str, own_name: &str) -> bool {
    let tokens = words(text);
    let mentions_self = words(own_name)
        .first()
        .is_some_and(|first| tokens.contains(first));
    let narrated = tokens
        .first()
        .is_some_and(|w| THIRD_PERSON_SUBJECTS.contains(&w.as_str()));
    if mentions_self || narrated {
        return false;
    }
    tokens.iter().enumerate().any(|(i, w)| {
        FIRST_PERSON.contains(&w.as_str()) || is_first_person_verb(w, i == 0)
    })
}

fn quotes_counterpart(text: &str, counterpart: &str, quotes: &[String]) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains(&format!("{}:", counterpart.to_lowercase()))
        || quotes.iter().any(|q| lowered.contains(q.as_str()))
}

fn has_content(fields: &Map<String, Value>) -> bool {
    fields
        .values()
        .any(|v| v.as_array().is_some_and(|a| !a.is_empty()))
}

fn recent_summary(feedback: &MemoryRecord) -> String {
    let texts = feedback.texts("recent_reflections");
    let skip = texts.len().saturating_sub(RECENT_CAP);
    texts[skip..]
        .iter()
        .map(|t| format!("- {t}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct PersonaAnalyzer {
    persona: Persona,
    memory: MemoryRecord,
    memory_store: MemoryStore,
    feedback_store: MemoryStore,
    deps: Collaborators,
    settings: CycleSettings,
}

impl PersonaAnalyzer {
    /// `stored` is whatever the repository returned; it is validated here.
    pub fn new(
        persona: Persona,
        stored: Option<Value>,
        deps: Collaborators,
        settings: CycleSettings,
    ) -> Self {
        let memory_store = MemoryStore::new(&PERSONA_SCHEMA, settings.reference_date);
        let memory = match stored {
            Some(value) => memory_store.validate(&value),
            None => memory_store.empty(),
        };
        Self {
            persona,
            memory,
            memory_store,
            feedback_store: MemoryStore::new(&FEEDBACK_SCHEMA, settings.reference_date),
            deps,
            settings,
        }
    }

    fn needs_profile(&self) -> bool {
        let defaults = PERSONA_SCHEMA.defaults();
        PROFILE_FIELDS
            .iter()
            .all(|f| self.memory.get(f) == defaults.get(*f))
    }

    /// Build the initial profile from the leading blocks that fit the profile
    /// budget. Returns whether the memory changed.
    pub async fn bootstrap_profile(&mut self, blocks: &[InteractionBlock]) -> bool {
        let mut lines = Vec::new();
        let mut tokens = 0;
        for block in blocks {
            let text = render_for(&self.persona, std::slice::from_ref(block));
            let cost = estimate_tokens(&text);
            if tokens + cost > self.settings.profile_budget {
                break;
            }
            tokens += cost;
            lines.push(text);
        }
        if lines.is_empty() {
            tracing::warn!(persona = %self.persona.name, "no block fits the profile budget, skipping initial profile");
            return false;
        }

        tracing::info!(persona = %self.persona.name, tokens, "building initial profile");
        let prompt = self.deps.prompts.profile(
            &self.persona,
            &lines.join("\n"),
            self.settings.reference_date,
        );
        let raw = match self.deps.model.complete(&self.settings.request(prompt)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(persona = %self.persona.name, error = %e, "initial profile call failed");
                return false;
            }
        };

        let repaired = repair::repair(&raw, &self.memory_store);
        let profile: Map<String, Value> = repaired
            .fields
            .into_iter()
            .filter(|(k, _)| PROFILE_FIELDS.contains(&k.as_str()))
            .collect();
        if profile.is_empty() {
            tracing::warn!(persona = %self.persona.name, "initial profile came back empty");
            return false;
        }
        self.memory = self.memory_store.merge(&self.memory, &Value::Object(profile));
        true
    }

    /// Run every batch in order, each seeing the memory left by the previous
    /// one. Never fails: a batch that cannot be analyzed contributes nothing.
    pub async fn run_cycle(mut self, blocks: &[InteractionBlock]) -> CycleOutcome {
        if self.needs_profile() {
            self.bootstrap_profile(blocks).await;
        }

        let batches =
            TokenBudgetBatcher::new(self.settings.budget, self.settings.overlap).split(blocks);
        let mut stats = CycleStats {
            batches: batches.len(),
            ..CycleStats::default()
        };
        let mut feedback = self.feedback_store.empty();
        tracing::info!(persona = %self.persona.name, batches = batches.len(), "analysis cycle started");

        for (i, batch) in batches.iter().enumerate() {
            tracing::debug!(
                persona = %self.persona.name,
                batch = i + 1,
                batch_id = %batch.id,
                tokens = batch.tokens,
                fresh = batch.fresh().len(),
                "processing batch"
            );
            let contribution = match self.cached(batch).await {
                Some(fields) => {
                    stats.cached += 1;
                    fields
                }
                None => {
                    let summary = recent_summary(&feedback);
                    match self.analyze_batch(batch, &summary).await {
                        Some((fields, rejected)) => {
                            stats.analyzed += 1;
                            stats.rejected += rejected;
                            self.remember(batch, &fields).await;
                            fields
                        }
                        None => {
                            stats.failed += 1;
                            continue;
                        }
                    }
                }
            };

            let update = Value::Object(contribution);
            self.memory = self.memory_store.merge(&self.memory, &update);
            feedback = self.feedback_store.merge(&feedback, &update);
        }

        if stats.batches > 0 && self.feedback_store.is_empty(&feedback) {
            tracing::warn!(persona = %self.persona.name, "cycle produced no usable feedback");
        }
        tracing::info!(
            persona = %self.persona.name,
            analyzed = stats.analyzed,
            cached = stats.cached,
            failed = stats.failed,
            rejected = stats.rejected,
            "analysis cycle finished"
        );

        CycleOutcome {
            persona: self.persona,
            memory: self.memory,
            feedback,
            stats,
        }
    }

    fn cache_key(&self, batch: &Batch<InteractionBlock>) -> String {
        format!("{}@{}", batch.id, self.settings.reference_date)
    }

    async fn cached(&self, batch: &Batch<InteractionBlock>) -> Option<Map<String, Value>> {
        let cache = self.deps.cache.as_ref()?;
        let value = cache.get(&self.persona.slug(), &self.cache_key(batch)).await?;
        tracing::info!(persona = %self.persona.name, batch_id = %batch.id, "cache hit, reusing feedback");
        let (fields, _) = self.feedback_store.normalize_partial(&value);
        Some(fields)
    }

    async fn remember(&self, batch: &Batch<InteractionBlock>, fields: &Map<String, Value>) {
        let Some(cache) = &self.deps.cache else {
            return;
        };
        if has_content(fields) {
            cache
                .put(
                    &self.persona.slug(),
                    &self.cache_key(batch),
                    &Value::Object(fields.clone()),
                )
                .await;
        }
    }

    /// Prompt, call and repair one batch. `None` when nothing usable came back.
    async fn analyze_batch(
        &self,
        batch: &Batch<InteractionBlock>,
        summary: &str,
    ) -> Option<(Map<String, Value>, usize)> {
        let conversation = render_for(&self.persona, &batch.units);
        let prompt = self.deps.prompts.batch(&BatchPrompt {
            persona: &self.persona,
            memory: &self.memory,
            conversation: &conversation,
            summary,
            date: self.settings.reference_date,
        });

        let raw = match self.deps.model.complete(&self.settings.request(prompt)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    persona = %self.persona.name,
                    batch_id = %batch.id,
                    error = %e,
                    "batch model call failed, contributing nothing"
                );
                return None;
            }
        };

        let repaired = repair::repair(&raw, &self.feedback_store);
        if repaired.failed() {
            tracing::warn!(persona = %self.persona.name, batch_id = %batch.id, "batch response unusable");
            return None;
        }
        tracing::debug!(
            persona = %self.persona.name,
            batch_id = %batch.id,
            stage = ?repaired.stage,
            discarded = repaired.discarded.len(),
            "batch response repaired"
        );
        Some(self.filter(repaired.fields, batch))
    }

    /// Keep dated entries that are first-person, carry the reference date
    /// and do not quote the counterpart. Returns the kept fields and the
    /// number of rejected entries.
    fn filter(
        &self,
        mut fields: Map<String, Value>,
        batch: &Batch<InteractionBlock>,
    ) -> (Map<String, Value>, usize) {
        let quotes: Vec<String> = batch
            .units
            .iter()
            .flat_map(|b| b.messages())
            .filter(|m| m.sender == self.persona.counterpart)
            .map(|m| m.content.trim().to_lowercase())
            .filter(|c| c.split_whitespace().count() >= MIN_QUOTE_WORDS)
            .collect();
        let date = self.settings.reference_date.format("%Y-%m-%d").to_string();

        let mut rejected = 0;
        for field in DATED_FIELDS {
            let Some(Value::Array(items)) = fields.get_mut(*field) else {
                continue;
            };
            items.retain(|entry| match self.rejection(entry, &date, &quotes) {
                Some(reason) => {
                    tracing::debug!(persona = %self.persona.name, field, reason, "entry filtered out");
                    rejected += 1;
                    false
                }
                None => true,
            });
        }
        (fields, rejected)
    }

    fn rejection(&self, entry: &Value, date: &str, quotes: &[String]) -> Option<&'static str> {
        let text = entry.get("text").and_then(Value::as_str).unwrap_or_default();
        if entry.get("date").and_then(Value::as_str) != Some(date) {
            return Some("not dated with the reference date");
        }
        if !is_first_person(text, &self.persona.name) {
            return Some("not first person");
        }
        if quotes_counterpart(text, &self.persona.counterpart, quotes) {
            return Some("quotes the other persona");
        }
        None
    }
}
