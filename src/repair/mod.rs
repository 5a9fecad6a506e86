//! Best-effort recovery of structured records from model output.
//!
//! [`parse_lenient`] runs an ordered pipeline of text stages, each tried only
//! when the previous parse failed:
//!
//! 1. encoding recovery, fence stripping, direct parse
//! 2. token normalization, comma fixes, bracket balancing, parse
//! 3. the first balanced `{...}` span (then the greedy span) through 1-2
//!
//! [`repair`] then post-validates the object against a [`MemoryStore`]
//! schema. It never fails: exhausted input yields the schema's empty
//! instance with [`RepairStage::Failed`].

pub mod encoding;
pub mod json;

use serde_json::{Map, Value};

use crate::memory::{Discarded, MemoryRecord, MemoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    /// Parsed as-is after fence stripping.
    Direct,
    /// Parsed after text repair.
    Repaired,
    /// Parsed from an object span cut out of surrounding prose.
    Extracted,
    /// Nothing recoverable.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Repaired {
    pub stage: RepairStage,
    /// Normalized schema fields the response actually carried.
    pub fields: Map<String, Value>,
    pub discarded: Vec<Discarded>,
}

impl Repaired {
    pub fn failed(&self) -> bool {
        self.stage == RepairStage::Failed
    }

    /// The full instance: carried fields over schema defaults.
    pub fn into_record(self, store: &MemoryStore) -> MemoryRecord {
        store.validate(&Value::Object(self.fields))
    }
}

fn repair_text(text: &str) -> Option<Map<String, Value>> {
    let text = json::normalize_tokens(text);
    let text = json::fix_commas(&text);
    let text = json::balance(&text);
    json::parse_object(&text)
}

/// Recover a JSON object from arbitrary text, or `None`.
pub fn parse_lenient(raw: &str) -> Option<(Map<String, Value>, RepairStage)> {
    let recovered = encoding::recover(raw);
    let whole = recovered.trim();
    // Fences inside string values must not cut a valid object apart.
    if let Some(obj) = json::parse_object(whole) {
        return Some((obj, RepairStage::Direct));
    }

    let text = json::strip_fences(whole);
    if let Some(obj) = json::parse_object(text) {
        return Some((obj, RepairStage::Direct));
    }
    if let Some(obj) = repair_text(text) {
        return Some((obj, RepairStage::Repaired));
    }

    let sources = if text.len() == whole.len() {
        vec![text]
    } else {
        vec![text, whole]
    };
    for source in sources {
        let spans = [json::first_object_span(source), json::greedy_object_span(source)];
        for span in spans.into_iter().flatten() {
            if let Some(obj) = json::parse_object(span).or_else(|| repair_text(span)) {
                return Some((obj, RepairStage::Extracted));
            }
        }
    }
    None
}

/// Recover and schema-validate a model response. Total: never fails.
pub fn repair(raw: &str, store: &MemoryStore) -> Repaired {
    match parse_lenient(raw) {
        Some((obj, stage)) => {
            let (fields, discarded) = store.normalize_partial(&Value::Object(obj));
            Repaired {
                stage,
                fields,
                discarded,
            }
        }
        None => {
            let preview: String = raw.chars().take(200).collect();
            tracing::warn!(schema = store.schema().name, %preview, "unparseable model response");
            Repaired {
                stage: RepairStage::Failed,
                fields: Map::new(),
                discarded: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::schema::{ElementSpec, FieldKind, FieldSpec, MemorySchema};
    use crate::memory::PERSONA_SCHEMA;
    use chrono::NaiveDate;
    use serde_json::json;

    static VALUES_SCHEMA: MemorySchema = MemorySchema {
        name: "values",
        fields: &[
            FieldSpec {
                name: "valores",
                kind: FieldKind::Bounded { max: 3, element: ElementSpec::Text },
            },
            FieldSpec { name: "resumo", kind: FieldKind::Scalar },
        ],
    };

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 12).unwrap()
    }

    fn values_store() -> MemoryStore {
        MemoryStore::new(&VALUES_SCHEMA, date())
    }

    fn persona_store() -> MemoryStore {
        MemoryStore::new(&PERSONA_SCHEMA, date())
    }

    #[test]
    fn clean_json_round_trips() {
        let store = values_store();
        let repaired = repair(" {\"valores\": [\"honestidade\"]} ", &store);
        assert_eq!(repaired.stage, RepairStage::Direct);
        let record = repaired.into_record(&store);
        assert_eq!(record.to_value(), json!({"valores": ["honestidade"], "resumo": ""}));
    }

    #[test]
    fn malformed_json_is_repaired() {
        let store = values_store();
        let repaired = repair("{valores: ['honestidade'],}", &store);
        assert_eq!(repaired.stage, RepairStage::Repaired);
        assert_eq!(Value::Object(repaired.fields), json!({"valores": ["honestidade"]}));
    }

    #[test]
    fn unbalanced_braces_are_closed() {
        let (obj, stage) = parse_lenient("{\"a\": 1").unwrap();
        assert_eq!(stage, RepairStage::Repaired);
        assert_eq!(Value::Object(obj), json!({"a": 1}));
    }

    #[test]
    fn unparseable_text_yields_defaults() {
        let store = persona_store();
        let repaired = repair("not json at all", &store);
        assert!(repaired.failed());
        assert_eq!(repaired.into_record(&store), store.empty());
    }

    #[test]
    fn prose_around_json_is_cut_away() {
        let raw = "Claro! Aqui está a análise:\n{\"resumo\": \"ok\"}\nEspero que ajude.";
        let (obj, stage) = parse_lenient(raw).unwrap();
        assert_eq!(stage, RepairStage::Extracted);
        assert_eq!(Value::Object(obj), json!({"resumo": "ok"}));
    }

    #[test]
    fn fenced_json_with_mojibake() {
        let raw = "```json\n{\"resumo\": \"NÃ£o sei\"}\n```";
        let (obj, _) = parse_lenient(raw).unwrap();
        assert_eq!(obj["resumo"], json!("Não sei"));
    }

    #[test]
    fn post_validation_coerces_persona_lists() {
        let store = persona_store();
        let raw = r#"{"core_values": ["honestidade", 3, {"description": "sem valor"}],
                     "recent_reflections": [{"text": "Senti-me ouvida", "date": "ontem"}]}"#;
        let repaired = repair(raw, &store);
        assert_eq!(repaired.discarded.len(), 2);
        assert_eq!(
            repaired.fields["core_values"],
            json!([{"value": "honestidade", "description": ""}])
        );
        assert_eq!(repaired.fields["recent_reflections"][0]["date"], json!("2025-04-12"));
    }

    #[test]
    fn valid_input_matches_plain_parse_after_normalization() {
        let store = persona_store();
        let raw = r#"{"personality_summary": "calma", "plans": [{"text": "viajar", "date": "2025-04-12"}]}"#;
        let expected = store.validate(&serde_json::from_str::<Value>(raw).unwrap());
        assert_eq!(repair(raw, &store).into_record(&store), expected);
    }

    #[test]
    fn repair_is_total() {
        let store = persona_store();
        let inputs = [
            "",
            "   ",
            "{",
            "}",
            "[1, 2, 3]",
            "\"just a string\"",
            "{\"core_values\": [\"a\", {\"value\": \"b\"",
            "{'recent_reflections': [{'text': 'x', 'date': '2025-04-12'}",
            "```json\n{\"plans\": [",
            "null",
            "{{{{[[[[",
            "}}}}]]]]",
            "ð\u{FFFD}\u{80}",
        ];
        for input in inputs {
            let record = repair(input, &store).into_record(&store);
            assert_eq!(store.validate(&record.to_value()), record, "input {input:?}");
            assert_eq!(record.fields().len(), PERSONA_SCHEMA.fields.len());
        }
    }

    #[test]
    fn fences_inside_string_values_are_kept() {
        let store = persona_store();
        let raw = r#"{"personality_summary": "Escreve ```code``` nas mensagens"}"#;
        let repaired = repair(raw, &store);
        assert_eq!(repaired.stage, RepairStage::Direct);
        assert_eq!(
            repaired.fields["personality_summary"],
            json!("Escreve ```code``` nas mensagens")
        );
    }

    #[test]
    fn prose_with_fenced_values_falls_back_to_whole_text() {
        let raw = "Aqui vai: {\"resumo\": \"usa ```x``` sempre\"} obrigado";
        let (obj, stage) = parse_lenient(raw).unwrap();
        assert_eq!(stage, RepairStage::Extracted);
        assert_eq!(obj["resumo"], json!("usa ```x``` sempre"));
    }

    #[test]
    fn truncated_json_keeps_complete_members() {
        let store = persona_store();
        let raw = "{\"core_values\": [\"a\", {\"value\": \"b\"";
        let repaired = repair(raw, &store);
        assert!(!repaired.failed());
        assert_eq!(repaired.fields["core_values"].as_array().unwrap().len(), 2);
    }
}
