use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One normalized chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub sender: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// A message paired with the other sender's reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionBlock {
    pub input: Message,
    pub response: Message,
}

impl InteractionBlock {
    /// Pairs two messages, rejecting same-sender or out-of-order pairs.
    pub fn pair(input: Message, response: Message) -> Option<Self> {
        if input.sender == response.sender || input.timestamp > response.timestamp {
            return None;
        }
        Some(Self { input, response })
    }

    pub fn messages(&self) -> [&Message; 2] {
        [&self.input, &self.response]
    }
}

/// One of the two simulated identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Persona {
    pub name: String,
    pub counterpart: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, counterpart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counterpart: counterpart.into(),
        }
    }

    /// File-safe identifier used for memory files and cache keys.
    pub fn slug(&self) -> String {
        self.name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

/// The synthesized relationship report for one cycle. Immutable once appended
/// to history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationalRecord {
    pub date: NaiveDate,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub advice: Vec<String>,
}

impl RelationalRecord {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            strengths: Vec::new(),
            challenges: Vec::new(),
            advice: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty() && self.challenges.is_empty() && self.advice.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(sender: &str, ms: i64) -> Message {
        Message {
            sender: sender.into(),
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
            content: "hi".into(),
        }
    }

    #[test]
    fn pair_requires_distinct_senders() {
        assert!(InteractionBlock::pair(msg("Ana", 1), msg("Ana", 2)).is_none());
        assert!(InteractionBlock::pair(msg("Ana", 1), msg("Bruno", 2)).is_some());
    }

    #[test]
    fn pair_requires_chronological_order() {
        assert!(InteractionBlock::pair(msg("Ana", 5), msg("Bruno", 2)).is_none());
        assert!(InteractionBlock::pair(msg("Ana", 5), msg("Bruno", 5)).is_some());
    }

    #[test]
    fn message_timestamp_serializes_as_millis() {
        let json = serde_json::to_value(msg("Ana", 1_729_281_008_866)).unwrap();
        assert_eq!(json["timestamp"], 1_729_281_008_866_i64);
    }

    #[test]
    fn persona_slug_is_file_safe() {
        assert_eq!(Persona::new("Ana Lima", "Bruno").slug(), "ana_lima");
    }
}
