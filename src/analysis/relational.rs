//! Relational synthesis from both personas' cycle feedback.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use super::CycleSettings;
use crate::llm::CompletionModel;
use crate::memory::merge::shallow_merge;
use crate::memory::{MemoryRecord, MemoryStore, RELATIONAL_SCHEMA};
use crate::prompts::{PromptSource, RelationalPrompt};
use crate::repair;
use crate::types::{Persona, RelationalRecord};

/// Items kept per report list.
pub const REPORT_MAX: usize = 3;

/// Accepted response shapes, in preference order: (strengths, challenges, advice).
const REPORT_SHAPES: &[[&str; 3]] = &[
    ["strengths", "challenges", "advice"],
    ["positives", "negatives", "conclusion"],
    ["positivos", "negativos", "conselhos"],
];

fn report_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        // A conclusion often arrives as one sentence.
        Some(v @ Value::String(_)) => vec![v],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(REPORT_MAX)
        .map(str::to_string)
        .collect()
}

/// Read a report from the first shape whose keys the object carries.
pub fn extract_report(obj: &Map<String, Value>, date: NaiveDate) -> RelationalRecord {
    let Some([strengths, challenges, advice]) = REPORT_SHAPES
        .iter()
        .find(|keys| keys.iter().any(|k| obj.contains_key(*k)))
    else {
        return RelationalRecord::empty(date);
    };
    RelationalRecord {
        date,
        strengths: report_list(obj.get(*strengths)),
        challenges: report_list(obj.get(*challenges)),
        advice: report_list(obj.get(*advice)),
    }
}

pub struct RelationalSynthesizer {
    model: Arc<dyn CompletionModel>,
    prompts: Arc<dyn PromptSource>,
    store: MemoryStore,
    memory: MemoryRecord,
    settings: CycleSettings,
}

impl RelationalSynthesizer {
    pub fn new(
        model: Arc<dyn CompletionModel>,
        prompts: Arc<dyn PromptSource>,
        stored: Option<Value>,
        settings: CycleSettings,
    ) -> Self {
        let store = MemoryStore::new(&RELATIONAL_SCHEMA, settings.reference_date);
        let memory = match stored {
            Some(value) => store.validate(&value),
            None => store.empty(),
        };
        Self {
            model,
            prompts,
            store,
            memory,
            settings,
        }
    }

    pub fn memory(&self) -> &MemoryRecord {
        &self.memory
    }

    /// One model call over both feedback payloads. Always yields a record,
    /// empty when nothing could be recovered, and appends it to history.
    pub async fn synthesize(
        &mut self,
        personas: [&Persona; 2],
        feedback: [&MemoryRecord; 2],
    ) -> RelationalRecord {
        let date = self.settings.reference_date;
        let feedback_values = feedback.map(MemoryRecord::to_value);
        let profiles = self.memory.get("profiles").cloned().unwrap_or_default();
        let prompt = self.prompts.relational(&RelationalPrompt {
            personas,
            feedback: [&feedback_values[0], &feedback_values[1]],
            profiles: &profiles,
        });

        let record = match self.model.complete(&self.settings.request(prompt)).await {
            Ok(raw) => match repair::parse_lenient(&raw) {
                Some((obj, stage)) => {
                    tracing::debug!(?stage, "relational response repaired");
                    extract_report(&obj, date)
                }
                None => {
                    let preview: String = raw.chars().take(200).collect();
                    tracing::warn!(%preview, "unparseable relational response, reporting empty lists");
                    RelationalRecord::empty(date)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "relational model call failed, reporting empty lists");
                RelationalRecord::empty(date)
            }
        };
        if record.is_empty() {
            tracing::warn!("relational report is empty");
        }

        self.append(&record, personas, feedback);
        record
    }

    fn append(
        &mut self,
        record: &RelationalRecord,
        personas: [&Persona; 2],
        feedback: [&MemoryRecord; 2],
    ) {
        let existing = self.memory.get("profiles");
        let mut profiles = Map::new();
        for (persona, fb) in personas.iter().zip(feedback) {
            let current = existing.and_then(|p| p.get(&persona.name));
            profiles.insert(persona.name.clone(), shallow_merge(current, fb.fields()));
        }
        let history_entry = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "could not serialize relational record");
                return;
            }
        };
        let update = serde_json::json!({
            "history": [history_entry],
            "profiles": profiles,
        });
        self.memory = self.store.merge(&self.memory, &update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::testing::ScriptedModel;
    use crate::memory::FEEDBACK_SCHEMA;
    use crate::prompts::DefaultPrompts;
    use serde_json::json;

    fn settings() -> CycleSettings {
        CycleSettings {
            budget: 3000,
            overlap: false,
            profile_budget: 3000,
            max_tokens: 1000,
            temperature: 0.3,
            reference_date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
        }
    }

    fn synthesizer(model: Arc<ScriptedModel>, stored: Option<Value>) -> RelationalSynthesizer {
        RelationalSynthesizer::new(model, Arc::new(DefaultPrompts), stored, settings())
    }

    fn feedback(text: &str) -> MemoryRecord {
        MemoryStore::new(&FEEDBACK_SCHEMA, settings().reference_date).validate(&json!({
            "recent_reflections": [{"date": "2025-04-12", "text": text}]
        }))
    }

    fn personas() -> (Persona, Persona) {
        (Persona::new("Maria", "Rui"), Persona::new("Rui", "Maria"))
    }

    #[test]
    fn legacy_shapes_are_accepted_in_order() {
        let date = settings().reference_date;
        let obj = json!({"positives": ["a", "b", "c", "d"], "negatives": "x", "conclusion": "talk more"});
        let report = extract_report(obj.as_object().unwrap(), date);
        assert_eq!(report.strengths, ["a", "b", "c"]);
        assert_eq!(report.challenges, ["x"]);
        assert_eq!(report.advice, ["talk more"]);

        let obj = json!({"positivos": ["confiança"], "conselhos": ["viajar"]});
        let report = extract_report(obj.as_object().unwrap(), date);
        assert_eq!(report.strengths, ["confiança"]);
        assert_eq!(report.advice, ["viajar"]);

        let obj = json!({"strengths": ["trust"], "positives": ["ignored"]});
        assert_eq!(extract_report(obj.as_object().unwrap(), date).strengths, ["trust"]);

        assert!(extract_report(&Map::new(), date).is_empty());
    }

    #[tokio::test]
    async fn synthesize_appends_history_and_profiles() {
        let model = Arc::new(ScriptedModel::replying(&[
            "Here it is:\n{\"strengths\": [\"Mutual trust\"], \"challenges\": [\"Distance\",], \"advice\": [\"Plan quality time\"]}",
        ]));
        let (a, b) = personas();
        let (fa, fb) = (feedback("Eu senti-me ouvida"), feedback("Eu quero viajar"));
        let mut synth = synthesizer(model, None);

        let record = synth.synthesize([&a, &b], [&fa, &fb]).await;
        assert_eq!(record.strengths, ["Mutual trust"]);
        assert_eq!(record.challenges, ["Distance"]);

        let memory = synth.memory();
        assert_eq!(memory.list("history").len(), 1);
        assert_eq!(memory.list("history")[0]["date"], json!("2025-04-12"));
        let profiles = memory.get("profiles").unwrap();
        assert_eq!(
            profiles["Maria"]["recent_reflections"][0]["text"],
            json!("Eu senti-me ouvida")
        );
        assert!(profiles["Rui"].is_object());
    }

    #[tokio::test]
    async fn failure_yields_empty_record_and_keeps_history() {
        let stored = json!({
            "history": [{"date": "2025-04-05", "strengths": ["trust"], "challenges": [], "advice": []}],
            "profiles": {"Maria": {"plans": ["old"]}}
        });
        let model = Arc::new(ScriptedModel::new([Err(LlmError::ContextLengthExceeded {
            detail: "too long".into(),
        })]));
        let (a, b) = personas();
        let (fa, fb) = (feedback("Eu senti-me ouvida"), feedback("Eu quero viajar"));
        let mut synth = synthesizer(model.clone(), Some(stored));

        let record = synth.synthesize([&a, &b], [&fa, &fb]).await;
        assert!(record.is_empty());
        assert_eq!(model.calls(), 1);

        let history = synth.memory().list("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["strengths"], json!(["trust"]));
        // Incoming feedback wins per key, older keys survive.
        let maria = &synth.memory().get("profiles").unwrap()["Maria"];
        assert_eq!(maria["plans"], json!([]));
        assert!(maria["recent_reflections"].is_array());
    }

    #[tokio::test]
    async fn unparseable_reply_is_not_fatal() {
        let model = Arc::new(ScriptedModel::replying(&["I cannot help with that."]));
        let (a, b) = personas();
        let (fa, fb) = (feedback("Eu"), feedback("Eu"));
        let record = synthesizer(model, None).synthesize([&a, &b], [&fa, &fb]).await;
        assert_eq!(record, RelationalRecord::empty(settings().reference_date));
    }
}
