//! Per-kind merge rules.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::schema::{ElementSpec, FieldKind, MemorySchema, NestedSpec};

/// Identity used to deduplicate list entries, if the element type has one.
fn identity_of(item: &Value, element: &ElementSpec) -> Option<String> {
    let key = match element {
        ElementSpec::Text => item.as_str()?,
        ElementSpec::Record(spec) => item.get(spec.identity?)?.as_str()?,
    };
    Some(key.trim().to_lowercase())
}

/// Stable-by-key deduplication: a repeated identity overwrites the body of
/// the first occurrence in place. Entries without identity are kept as is.
pub fn dedup(items: Vec<Value>, element: &ElementSpec) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for item in items {
        match identity_of(&item, element) {
            Some(key) => match seen.get(&key) {
                Some(&pos) => out[pos] = item,
                None => {
                    seen.insert(key, out.len());
                    out.push(item);
                }
            },
            None => out.push(item),
        }
    }
    out
}

/// Deduplicate keeping each identity at its last position, then keep the
/// newest `cap` entries. A rewrite counts as the most recent write.
pub fn keep_latest(items: Vec<Value>, element: &ElementSpec, cap: usize) -> Vec<Value> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut newest_first: Vec<Value> = Vec::with_capacity(items.len());
    for item in items.into_iter().rev() {
        if newest_first.len() == cap {
            break;
        }
        if let Some(key) = identity_of(&item, element) {
            if !seen.insert(key) {
                continue;
            }
        }
        newest_first.push(item);
    }
    newest_first.reverse();
    newest_first
}

fn take_list(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn is_empty_text(value: &Value) -> bool {
    value.as_str().map_or(true, |s| s.trim().is_empty())
}

/// Shallow merge: incoming sub-keys overwrite existing ones.
pub fn shallow_merge(current: Option<&Value>, incoming: &Map<String, Value>) -> Value {
    let mut merged = current
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (k, v) in incoming {
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

impl MemorySchema {
    /// Apply an already-normalized partial update to a validated instance.
    ///
    /// Fields absent from `incoming` are left untouched.
    pub fn merge_fields(
        &self,
        current: &Map<String, Value>,
        incoming: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut merged = current.clone();
        for spec in self.fields {
            let Some(update) = incoming.get(spec.name) else {
                continue;
            };
            let existing = current.get(spec.name);
            let next = match &spec.kind {
                FieldKind::Scalar => {
                    if is_empty_text(update) {
                        continue;
                    }
                    update.clone()
                }
                FieldKind::Nested(NestedSpec::Declared(_) | NestedSpec::Open) => {
                    let Some(sub) = update.as_object() else {
                        continue;
                    };
                    shallow_merge(existing, sub)
                }
                FieldKind::Capped { cap, element } => {
                    let mut items = take_list(existing);
                    items.extend(take_list(Some(update)));
                    Value::Array(keep_latest(items, element, *cap))
                }
                FieldKind::Bounded { max, element } => {
                    let incoming_items = take_list(Some(update));
                    if incoming_items.is_empty() {
                        continue;
                    }
                    let mut items = dedup(incoming_items, element);
                    items.truncate(*max);
                    Value::Array(items)
                }
                FieldKind::Accumulating { element } => {
                    let mut items = take_list(existing);
                    items.extend(take_list(Some(update)));
                    Value::Array(dedup(items, element))
                }
            };
            merged.insert(spec.name.to_string(), next);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::schema::{FEEDBACK_SCHEMA, PERSONA_SCHEMA, RECENT_CAP, RELATIONAL_SCHEMA};
    use chrono::NaiveDate;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 12).unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn reflection(text: &str) -> Value {
        json!({"text": text, "date": "2025-04-12"})
    }

    #[test]
    fn scalar_keeps_existing_on_empty_update() {
        let current = PERSONA_SCHEMA.validate(&json!({"personality_summary": "warm"}), date());
        let merged = PERSONA_SCHEMA.merge_fields(&current, &obj(json!({"personality_summary": ""})));
        assert_eq!(merged["personality_summary"], json!("warm"));
        let merged = PERSONA_SCHEMA.merge_fields(&current, &obj(json!({"personality_summary": "calm"})));
        assert_eq!(merged["personality_summary"], json!("calm"));
    }

    #[test]
    fn nested_incoming_wins_per_sub_key() {
        let current = PERSONA_SCHEMA.validate(
            &json!({"personality": {"traits": ["shy"], "description": "quiet"}}),
            date(),
        );
        let merged = PERSONA_SCHEMA.merge_fields(
            &current,
            &obj(json!({"personality": {"description": "reserved"}})),
        );
        assert_eq!(
            merged["personality"],
            json!({"traits": ["shy"], "description": "reserved"})
        );
    }

    #[test]
    fn capped_keeps_most_recent() {
        let existing: Vec<_> = (0..4).map(|i| reflection(&format!("old {i}"))).collect();
        let current = PERSONA_SCHEMA.validate(&json!({"recent_reflections": existing}), date());
        let update = obj(json!({"recent_reflections": [reflection("new 1"), reflection("new 2")]}));
        let merged = PERSONA_SCHEMA.merge_fields(&current, &update);
        let texts: Vec<_> = merged["recent_reflections"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts.len(), RECENT_CAP);
        assert_eq!(texts, ["old 1", "old 2", "old 3", "new 1", "new 2"]);
    }

    #[test]
    fn capped_dedups_by_identity_last_write_wins() {
        let current = PERSONA_SCHEMA.validate(
            &json!({"recent_reflections": [{"text": "Same", "date": "2025-04-01"}]}),
            date(),
        );
        let merged = PERSONA_SCHEMA.merge_fields(
            &current,
            &obj(json!({"recent_reflections": [{"text": "same", "date": "2025-04-12"}]})),
        );
        assert_eq!(
            merged["recent_reflections"],
            json!([{"text": "same", "date": "2025-04-12"}])
        );
    }

    #[test]
    fn capped_rewrite_counts_as_newest() {
        let existing: Vec<_> = ["a", "b", "c", "d", "e"].map(reflection).to_vec();
        let current = PERSONA_SCHEMA.validate(&json!({"recent_reflections": existing}), date());
        let update = obj(json!({"recent_reflections": [reflection("A"), reflection("f")]}));
        let merged = PERSONA_SCHEMA.merge_fields(&current, &update);
        let texts: Vec<_> = merged["recent_reflections"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, ["c", "d", "e", "A", "f"]);
    }

    #[test]
    fn bounded_replaces_and_truncates() {
        let current = PERSONA_SCHEMA.validate(&json!({"core_values": ["a", "b"]}), date());
        let update = obj(json!({"core_values": [
            {"value": "c", "description": ""},
            {"value": "d", "description": ""},
            {"value": "e", "description": ""},
            {"value": "f", "description": ""}
        ]}));
        let merged = PERSONA_SCHEMA.merge_fields(&current, &update);
        let values: Vec<_> = merged["core_values"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["value"].as_str().unwrap())
            .collect();
        assert_eq!(values, ["c", "d", "e"]);
    }

    #[test]
    fn bounded_ignores_empty_update() {
        let current = PERSONA_SCHEMA.validate(&json!({"core_values": ["a"]}), date());
        let merged = PERSONA_SCHEMA.merge_fields(&current, &obj(json!({"core_values": []})));
        assert_eq!(merged["core_values"], current["core_values"]);
    }

    #[test]
    fn accumulating_is_monotonic() {
        let first = json!({"date": "2025-04-05", "strengths": ["trust"], "challenges": [], "advice": []});
        let second = json!({"date": "2025-04-12", "strengths": ["trust"], "challenges": [], "advice": []});
        let current = RELATIONAL_SCHEMA.validate(&json!({"history": [first.clone()]}), date());
        let merged = RELATIONAL_SCHEMA.merge_fields(&current, &obj(json!({"history": [second.clone()]})));
        let history = merged["history"].as_array().unwrap();
        assert!(history.contains(&first));
        assert!(history.contains(&second));

        // Identical entries without identity are still appended.
        let again = RELATIONAL_SCHEMA.merge_fields(&merged, &obj(json!({"history": [second]})));
        assert_eq!(again["history"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn feedback_union_dedups_across_batches() {
        let mut acc = FEEDBACK_SCHEMA.validate(&json!({}), date());
        for batch in [
            json!({"recent_reflections": [reflection("a"), reflection("b")]}),
            json!({"recent_reflections": [reflection("b"), reflection("c")]}),
        ] {
            acc = FEEDBACK_SCHEMA.merge_fields(&acc, &obj(batch));
        }
        assert_eq!(acc["recent_reflections"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn absent_fields_are_untouched() {
        let current = PERSONA_SCHEMA.validate(&json!({"plans": ["travel"]}), date());
        let merged = PERSONA_SCHEMA.merge_fields(&current, &Map::new());
        assert_eq!(merged, current);
    }
}
