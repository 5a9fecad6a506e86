//! Prompt text. The pipeline treats prompts as opaque strings produced by a
//! [`PromptSource`]; nothing downstream depends on their wording.

use chrono::NaiveDate;
use serde_json::Value;

use crate::memory::MemoryRecord;
use crate::types::Persona;

/// Everything a per-batch prompt may embed.
pub struct BatchPrompt<'a> {
    pub persona: &'a Persona,
    pub memory: &'a MemoryRecord,
    /// The batch rendered from the persona's perspective.
    pub conversation: &'a str,
    /// Reflections accepted from earlier batches of this cycle.
    pub summary: &'a str,
    pub date: NaiveDate,
}

pub struct RelationalPrompt<'a> {
    pub personas: [&'a Persona; 2],
    pub feedback: [&'a Value; 2],
    /// Profile snapshots held in relational memory.
    pub profiles: &'a Value,
}

pub trait PromptSource: Send + Sync {
    fn profile(&self, persona: &Persona, conversation: &str, date: NaiveDate) -> String;
    fn batch(&self, ctx: &BatchPrompt<'_>) -> String;
    fn relational(&self, ctx: &RelationalPrompt<'_>) -> String;
}

const PROFILE_PROMPT: &str = r#"Build a psychological profile from this conversation.
"Me" is the person being profiled; focus on their messages and use the other person's messages only as context.

Return JSON only, no other text, with:
- personality: {"traits": ["string"], "description": "string"}
- core_values: [{"value": "string", "description": "string"}]
- emotional_patterns: [{"emotion": "string", "triggers": ["string"], "description": "string"}]
- relational_dynamics: {"strengths": ["string"], "challenges": ["string"], "patterns": ["string"]}
- personality_summary: "string"
At most 3 items per list. Use double quotes."#;

const BATCH_PROMPT: &str = r#"Reflect on this part of the conversation as yourself. "Me" is you.
Speak in the first person about your own feelings and thoughts. Do not quote the other person.

Return JSON only, no other text, with:
- recent_reflections: [{"date": "YYYY-MM-DD", "text": "string"}]
- plans: [{"date": "YYYY-MM-DD", "text": "string"}]
- compliments: [{"date": "YYYY-MM-DD", "text": "string"}]
- core_values: [{"value": "string", "description": "string"}]
- emotional_patterns: [{"emotion": "string", "triggers": ["string"], "description": "string"}]
At most 2 items per list; use empty lists when nothing applies. Use double quotes."#;

const RELATIONAL_PROMPT: &str = r#"You are an analyst of romantic relationships. From the feedback and profiles below, write a relational report.

Return JSON only, no other text, with keys "strengths", "challenges" and "advice", each a list of at most 3 strings:
{"strengths": ["Mutual trust"], "challenges": ["Emotional distance"], "advice": ["Plan quality time"]}"#;

/// The built-in English prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrompts;

impl PromptSource for DefaultPrompts {
    fn profile(&self, persona: &Persona, conversation: &str, date: NaiveDate) -> String {
        format!(
            "{}\n\nYou are profiling {}; the other person is {}. Date: {}.\n\n---\n\nConversation:\n{}",
            PROFILE_PROMPT, persona.name, persona.counterpart, date, conversation
        )
    }

    fn batch(&self, ctx: &BatchPrompt<'_>) -> String {
        let summary = if ctx.summary.is_empty() {
            "(nothing yet)"
        } else {
            ctx.summary
        };
        format!(
            "{}\n\nYou are {}; the other person is {}. Date every entry {}.\n\nYour profile:\n{}\n\nSo far in this conversation you reflected:\n{}\n\n---\n\nConversation:\n{}",
            BATCH_PROMPT,
            ctx.persona.name,
            ctx.persona.counterpart,
            ctx.date,
            ctx.memory.to_value(),
            summary,
            ctx.conversation
        )
    }

    fn relational(&self, ctx: &RelationalPrompt<'_>) -> String {
        let [a, b] = ctx.personas;
        let [fa, fb] = ctx.feedback;
        format!(
            "{}\n\n---\n\n{}'s feedback: {}\n{}'s feedback: {}\nProfiles: {}",
            RELATIONAL_PROMPT, a.name, fa, b.name, fb, ctx.profiles
        )
    }
}
