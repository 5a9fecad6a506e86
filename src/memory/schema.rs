//! Declarative memory schemas.
//!
//! A schema is a static table of fields, each tagged with a [`FieldKind`] that
//! fixes both the accepted shape and the merge rule. Normalization coerces
//! what it can (a bare string becomes a minimal record) and reports the rest
//! as [`Discarded`] instead of failing.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};

/// Shape of a sub-key inside a record or nested object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Text,
    TextList,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordSpec {
    /// Sub-key that must be present and non-empty.
    pub required: &'static str,
    /// Auxiliary sub-keys, defaulted when missing.
    pub fields: &'static [(&'static str, SubKind)],
    /// Sub-key whose value identifies the record for deduplication.
    pub identity: Option<&'static str>,
    /// Sub-key holding an ISO `YYYY-MM-DD` date.
    pub date_key: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub enum ElementSpec {
    Text,
    Record(RecordSpec),
}

#[derive(Debug, Clone, Copy)]
pub enum NestedSpec {
    /// Fixed sub-keys with independent defaults.
    Declared(&'static [(&'static str, SubKind)]),
    /// Arbitrary sub-keys holding arbitrary JSON.
    Open,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Free text; replaced only by a non-empty incoming value.
    Scalar,
    /// Shallow-merged object; incoming sub-keys win.
    Nested(NestedSpec),
    /// Concatenated, deduplicated, then only the last `cap` entries kept.
    Capped { cap: usize, element: ElementSpec },
    /// Replaced by the incoming list truncated to `max` entries.
    Bounded { max: usize, element: ElementSpec },
    /// Appended without truncation.
    Accumulating { element: ElementSpec },
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

#[derive(Debug)]
pub struct MemorySchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

/// An entry dropped during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Discarded {
    pub field: String,
    pub reason: &'static str,
    pub value: Value,
}

const DATED_TEXT: RecordSpec = RecordSpec {
    required: "text",
    fields: &[("date", SubKind::Text)],
    identity: Some("text"),
    date_key: Some("date"),
};

const CORE_VALUE: RecordSpec = RecordSpec {
    required: "value",
    fields: &[("description", SubKind::Text)],
    identity: Some("value"),
    date_key: None,
};

const EMOTIONAL_PATTERN: RecordSpec = RecordSpec {
    required: "emotion",
    fields: &[("triggers", SubKind::TextList), ("description", SubKind::Text)],
    identity: Some("emotion"),
    date_key: None,
};

const RELATIONAL_ENTRY: RecordSpec = RecordSpec {
    required: "date",
    fields: &[
        ("strengths", SubKind::TextList),
        ("challenges", SubKind::TextList),
        ("advice", SubKind::TextList),
    ],
    identity: None,
    // Past entries keep whatever date they were written with.
    date_key: None,
};

/// Most recent entries kept for reflections, plans and compliments.
pub const RECENT_CAP: usize = 5;
/// Maximum entries kept per profile trait list.
pub const PROFILE_MAX: usize = 3;

/// One persona's accumulated psychological state.
pub static PERSONA_SCHEMA: MemorySchema = MemorySchema {
    name: "persona",
    fields: &[
        FieldSpec { name: "personality_summary", kind: FieldKind::Scalar },
        FieldSpec {
            name: "personality",
            kind: FieldKind::Nested(NestedSpec::Declared(&[
                ("traits", SubKind::TextList),
                ("description", SubKind::Text),
            ])),
        },
        FieldSpec {
            name: "relational_dynamics",
            kind: FieldKind::Nested(NestedSpec::Declared(&[
                ("strengths", SubKind::TextList),
                ("challenges", SubKind::TextList),
                ("patterns", SubKind::TextList),
            ])),
        },
        FieldSpec {
            name: "core_values",
            kind: FieldKind::Bounded { max: PROFILE_MAX, element: ElementSpec::Record(CORE_VALUE) },
        },
        FieldSpec {
            name: "emotional_patterns",
            kind: FieldKind::Bounded {
                max: PROFILE_MAX,
                element: ElementSpec::Record(EMOTIONAL_PATTERN),
            },
        },
        FieldSpec {
            name: "recent_reflections",
            kind: FieldKind::Capped { cap: RECENT_CAP, element: ElementSpec::Record(DATED_TEXT) },
        },
        FieldSpec {
            name: "plans",
            kind: FieldKind::Capped { cap: RECENT_CAP, element: ElementSpec::Record(DATED_TEXT) },
        },
        FieldSpec {
            name: "compliments",
            kind: FieldKind::Capped { cap: RECENT_CAP, element: ElementSpec::Record(DATED_TEXT) },
        },
    ],
};

/// The union of batch extractions for one persona over one cycle.
pub static FEEDBACK_SCHEMA: MemorySchema = MemorySchema {
    name: "feedback",
    fields: &[
        FieldSpec {
            name: "recent_reflections",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(DATED_TEXT) },
        },
        FieldSpec {
            name: "plans",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(DATED_TEXT) },
        },
        FieldSpec {
            name: "compliments",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(DATED_TEXT) },
        },
        FieldSpec {
            name: "core_values",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(CORE_VALUE) },
        },
        FieldSpec {
            name: "emotional_patterns",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(EMOTIONAL_PATTERN) },
        },
    ],
};

/// Relational history plus the synthesizer's per-persona profile snapshots.
pub static RELATIONAL_SCHEMA: MemorySchema = MemorySchema {
    name: "relational",
    fields: &[
        FieldSpec {
            name: "history",
            kind: FieldKind::Accumulating { element: ElementSpec::Record(RELATIONAL_ENTRY) },
        },
        FieldSpec { name: "profiles", kind: FieldKind::Nested(NestedSpec::Open) },
    ],
};

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static regex"));

impl MemorySchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The all-empty instance.
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.to_string(), default_for(&f.kind)))
            .collect()
    }

    /// Coerce the schema fields present in `value`, dropping unknown keys and
    /// invalid entries. Missing fields stay missing.
    pub fn normalize_partial(
        &self,
        value: &Value,
        fallback_date: NaiveDate,
    ) -> (Map<String, Value>, Vec<Discarded>) {
        let mut discarded = Vec::new();
        let mut out = Map::new();

        let Some(obj) = value.as_object() else {
            discarded.push(Discarded {
                field: self.name.to_string(),
                reason: "instance is not an object",
                value: value.clone(),
            });
            return (out, discarded);
        };

        for (key, raw) in obj {
            let Some(spec) = self.field(key) else {
                discarded.push(Discarded {
                    field: key.clone(),
                    reason: "key outside schema",
                    value: raw.clone(),
                });
                continue;
            };
            let ctx = Ctx {
                field: spec.name,
                fallback_date,
            };
            if let Some(v) = normalize_field(&spec.kind, raw, &ctx, &mut discarded) {
                out.insert(spec.name.to_string(), v);
            }
        }

        for d in &discarded {
            tracing::warn!(
                schema = self.name,
                field = %d.field,
                reason = d.reason,
                "discarded memory entry"
            );
        }
        (out, discarded)
    }

    /// Full normalization: every schema field present, nothing else.
    /// Idempotent.
    pub fn validate(&self, value: &Value, fallback_date: NaiveDate) -> Map<String, Value> {
        let (mut fields, _) = self.normalize_partial(value, fallback_date);
        for spec in self.fields {
            let entry = fields
                .entry(spec.name.to_string())
                .or_insert_with(|| default_for(&spec.kind));
            if let (FieldKind::Nested(NestedSpec::Declared(keys)), Value::Object(sub)) =
                (&spec.kind, entry)
            {
                for (k, kind) in keys.iter() {
                    sub.entry(k.to_string()).or_insert_with(|| default_sub(*kind));
                }
            }
        }
        fields
    }
}

struct Ctx {
    field: &'static str,
    fallback_date: NaiveDate,
}

impl Ctx {
    fn discard(&self, out: &mut Vec<Discarded>, reason: &'static str, value: &Value) {
        out.push(Discarded {
            field: self.field.to_string(),
            reason,
            value: value.clone(),
        });
    }
}

fn default_for(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Scalar => Value::String(String::new()),
        FieldKind::Nested(NestedSpec::Declared(keys)) => Value::Object(
            keys.iter()
                .map(|(k, kind)| (k.to_string(), default_sub(*kind)))
                .collect(),
        ),
        FieldKind::Nested(NestedSpec::Open) => Value::Object(Map::new()),
        _ => Value::Array(Vec::new()),
    }
}

fn default_sub(kind: SubKind) -> Value {
    match kind {
        SubKind::Text => Value::String(String::new()),
        SubKind::TextList => Value::Array(Vec::new()),
    }
}

/// Strings pass through; numbers and booleans are stringified.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn normalize_field(
    kind: &FieldKind,
    raw: &Value,
    ctx: &Ctx,
    discarded: &mut Vec<Discarded>,
) -> Option<Value> {
    match kind {
        FieldKind::Scalar => match raw {
            Value::Null => None,
            other => match as_text(other) {
                Some(s) => Some(Value::String(s)),
                None => {
                    ctx.discard(discarded, "scalar field holds a structure", raw);
                    None
                }
            },
        },
        FieldKind::Nested(spec) => {
            let Some(obj) = raw.as_object() else {
                ctx.discard(discarded, "nested field is not an object", raw);
                return None;
            };
            match spec {
                NestedSpec::Open => Some(raw.clone()),
                NestedSpec::Declared(keys) => {
                    let mut out = Map::new();
                    for (k, v) in obj {
                        match keys.iter().find(|(name, _)| *name == k.as_str()) {
                            Some((name, sub)) => {
                                out.insert(name.to_string(), normalize_sub(*sub, v, ctx, discarded));
                            }
                            None => ctx.discard(discarded, "sub-key outside schema", v),
                        }
                    }
                    Some(Value::Object(out))
                }
            }
        }
        FieldKind::Capped { cap, element } => {
            let items = normalize_list(element, raw, ctx, discarded)?;
            Some(Value::Array(super::merge::keep_latest(items, element, *cap)))
        }
        FieldKind::Bounded { max, element } => {
            let items = normalize_list(element, raw, ctx, discarded)?;
            let mut items = super::merge::dedup(items, element);
            items.truncate(*max);
            Some(Value::Array(items))
        }
        FieldKind::Accumulating { element } => {
            let items = normalize_list(element, raw, ctx, discarded)?;
            Some(Value::Array(super::merge::dedup(items, element)))
        }
    }
}

fn normalize_sub(kind: SubKind, raw: &Value, ctx: &Ctx, discarded: &mut Vec<Discarded>) -> Value {
    match kind {
        SubKind::Text => match as_text(raw) {
            Some(s) => Value::String(s),
            None => {
                if !raw.is_null() {
                    ctx.discard(discarded, "expected text", raw);
                }
                Value::String(String::new())
            }
        },
        SubKind::TextList => match raw {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .filter_map(|item| match as_text(item) {
                        Some(s) if !s.is_empty() => Some(Value::String(s)),
                        Some(_) => None,
                        None => {
                            ctx.discard(discarded, "expected text list element", item);
                            None
                        }
                    })
                    .collect(),
            ),
            Value::String(s) if !s.trim().is_empty() => {
                Value::Array(vec![Value::String(s.trim().to_string())])
            }
            Value::Null | Value::String(_) => Value::Array(Vec::new()),
            other => {
                ctx.discard(discarded, "expected text list", other);
                Value::Array(Vec::new())
            }
        },
    }
}

fn normalize_list(
    element: &ElementSpec,
    raw: &Value,
    ctx: &Ctx,
    discarded: &mut Vec<Discarded>,
) -> Option<Vec<Value>> {
    let items: Vec<&Value> = match raw {
        Value::Array(items) => items.iter().collect(),
        Value::Null => return None,
        // A lone entry where a list was expected.
        Value::String(_) | Value::Object(_) => vec![raw],
        other => {
            ctx.discard(discarded, "expected a list", other);
            return None;
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match element {
            ElementSpec::Text => match as_text(item) {
                Some(s) if !s.is_empty() => out.push(Value::String(s)),
                Some(_) => {}
                None => ctx.discard(discarded, "expected text element", item),
            },
            ElementSpec::Record(spec) => match normalize_record(spec, item, ctx, discarded) {
                Some(record) => out.push(record),
                None => ctx.discard(discarded, "entry lacks the required sub-key", item),
            },
        }
    }
    Some(out)
}

fn normalize_record(
    spec: &RecordSpec,
    item: &Value,
    ctx: &Ctx,
    discarded: &mut Vec<Discarded>,
) -> Option<Value> {
    let mut record = Map::new();
    match item {
        Value::String(s) if !s.trim().is_empty() => {
            record.insert(spec.required.to_string(), Value::String(s.trim().to_string()));
        }
        Value::Object(obj) => {
            let required = obj.get(spec.required).and_then(as_text)?;
            if required.is_empty() {
                return None;
            }
            record.insert(spec.required.to_string(), Value::String(required));
            for (key, kind) in spec.fields {
                if let Some(v) = obj.get(*key) {
                    record.insert(key.to_string(), normalize_sub(*kind, v, ctx, discarded));
                }
            }
        }
        _ => return None,
    }

    for (key, kind) in spec.fields {
        record.entry(key.to_string()).or_insert_with(|| default_sub(*kind));
    }
    if let Some(date_key) = spec.date_key {
        let valid = record
            .get(date_key)
            .and_then(Value::as_str)
            .is_some_and(|d| ISO_DATE.is_match(d));
        if !valid {
            record.insert(
                date_key.to_string(),
                Value::String(ctx.fallback_date.format("%Y-%m-%d").to_string()),
            );
        }
    }
    Some(Value::Object(record))
}
