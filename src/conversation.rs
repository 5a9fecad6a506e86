//! Conversation export loading, interaction-block pairing and per-persona
//! rendering.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::batch::render_message;
use crate::error::ConfigError;
use crate::repair::encoding;
use crate::types::{InteractionBlock, Message, Persona};

pub const AUDIO_PLACEHOLDER: &str = "[Audio message]";

#[derive(Debug, Default, Deserialize)]
struct ExportFile {
    #[serde(default)]
    participants: Vec<ExportParticipant>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportParticipant {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    sender_name: Option<String>,
    timestamp_ms: Option<i64>,
    content: Option<String>,
    #[serde(default)]
    audio_files: Vec<serde_json::Value>,
}

/// All export files merged into one chronological message stream.
#[derive(Debug, Default)]
pub struct Conversation {
    /// Canonical participant names in first-seen order.
    pub participants: Vec<String>,
    pub messages: Vec<Message>,
}

fn canonical(raw: &str, aliases: &BTreeMap<String, String>) -> String {
    let name = encoding::recover(raw.trim());
    aliases.get(&name).cloned().unwrap_or(name)
}

impl Conversation {
    fn absorb(&mut self, file: ExportFile, aliases: &BTreeMap<String, String>) {
        for participant in file.participants {
            let Some(name) = participant.name else {
                continue;
            };
            let name = canonical(&name, aliases);
            if !self.participants.contains(&name) {
                self.participants.push(name);
            }
        }
        for message in file.messages {
            let (Some(sender), Some(ms)) = (message.sender_name, message.timestamp_ms) else {
                tracing::debug!("skipping export message without sender or timestamp");
                continue;
            };
            let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(ms) else {
                tracing::debug!(timestamp_ms = ms, "skipping export message with invalid timestamp");
                continue;
            };
            let content = match message.content {
                Some(text) => encoding::recover(&text),
                None if !message.audio_files.is_empty() => AUDIO_PLACEHOLDER.to_string(),
                None => String::new(),
            };
            self.messages.push(Message {
                sender: canonical(&sender, aliases),
                timestamp,
                content,
            });
        }
    }

    /// Keep only messages from the `days` days before `reference` onwards.
    pub fn retain_since(&mut self, reference: NaiveDate, days: u32) {
        let Some(start) = reference
            .checked_sub_days(Days::new(u64::from(days)))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        else {
            return;
        };
        let start = start.and_utc();
        let before = self.messages.len();
        self.messages.retain(|m| m.timestamp >= start);
        tracing::info!(
            kept = self.messages.len(),
            dropped = before - self.messages.len(),
            since = %start.date_naive(),
            "applied look-back window"
        );
    }
}

/// Load every `*.json` export directly under `dir`.
///
/// Files that fail to parse are skipped with a warning; a directory without
/// any JSON file is fatal.
pub fn load_exports(
    dir: &Path,
    aliases: &BTreeMap<String, String>,
) -> Result<Conversation, ConfigError> {
    let files: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .collect();

    if files.is_empty() {
        return Err(ConfigError::NoExportFiles {
            dir: dir.to_path_buf(),
        });
    }

    let mut conversation = Conversation::default();
    for entry in &files {
        let path = entry.path();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable export file, skipping");
                continue;
            }
        };
        match serde_json::from_str::<ExportFile>(&content) {
            Ok(file) => conversation.absorb(file, aliases),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unparseable export file, skipping");
            }
        }
    }

    conversation.messages.sort_by_key(|m| m.timestamp);
    tracing::info!(
        files = files.len(),
        participants = conversation.participants.len(),
        messages = conversation.messages.len(),
        "loaded conversation exports"
    );
    Ok(conversation)
}

/// Pair every message with the next one when the senders differ.
pub fn pair_blocks(messages: &[Message]) -> Vec<InteractionBlock> {
    messages
        .windows(2)
        .filter_map(|w| InteractionBlock::pair(w[0].clone(), w[1].clone()))
        .collect()
}

/// The two personas: configured names when present, otherwise the first two
/// participants.
pub fn resolve_personas(
    configured: &[String],
    participants: &[String],
) -> Result<[Persona; 2], ConfigError> {
    let names = if configured.is_empty() {
        participants
    } else {
        configured
    };
    match names {
        [a, b, ..] => Ok([Persona::new(a, b), Persona::new(b, a)]),
        other => Err(ConfigError::MissingPersonas { found: other.len() }),
    }
}

/// Render blocks from `persona`'s point of view: their own lines are "Me".
pub fn render_for(persona: &Persona, blocks: &[InteractionBlock]) -> String {
    let mut lines = Vec::with_capacity(blocks.len() * 2);
    for block in blocks {
        for message in block.messages() {
            let speaker = if message.sender == persona.name {
                "Me"
            } else {
                message.sender.as_str()
            };
            lines.push(render_message(message, speaker));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn msg(sender: &str, ms: i64, content: &str) -> Message {
        Message {
            sender: sender.into(),
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
            content: content.into(),
        }
    }

    fn aliases() -> BTreeMap<String, String> {
        [("Maria Passos", "Maria"), ("Rui Silva", "Rui")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_merges_and_sorts_exports() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("message_1.json"),
            r#"{"participants": [{"name": "Rui Silva"}, {"name": "Maria Passos"}],
                "messages": [
                  {"sender_name": "Rui Silva", "timestamp_ms": 3000, "content": "NÃ£o sei"},
                  {"sender_name": "Maria Passos", "timestamp_ms": 1000, "audio_files": [{"uri": "a.mp4"}]}
                ]}"#,
        )
        .unwrap();
        fs::write(
            temp.path().join("message_2.json"),
            r#"{"participants": [{"name": "Maria Passos"}],
                "messages": [{"sender_name": "Maria Passos", "timestamp_ms": 2000, "content": "olá"}]}"#,
        )
        .unwrap();
        fs::write(temp.path().join("broken.json"), "{not json").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let conversation = load_exports(temp.path(), &aliases()).unwrap();
        assert_eq!(conversation.participants, ["Rui", "Maria"]);
        let contents: Vec<_> = conversation.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, [AUDIO_PLACEHOLDER, "olá", "Não sei"]);
        assert_eq!(conversation.messages[0].sender, "Maria");
    }

    #[test]
    fn empty_directory_is_fatal() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("readme.md"), "nothing").unwrap();
        assert!(matches!(
            load_exports(temp.path(), &BTreeMap::new()),
            Err(ConfigError::NoExportFiles { .. })
        ));
    }

    #[test]
    fn pairs_only_cross_sender_neighbours() {
        let messages = [
            msg("Maria", 1, "a"),
            msg("Maria", 2, "b"),
            msg("Rui", 3, "c"),
            msg("Maria", 4, "d"),
        ];
        let blocks = pair_blocks(&messages);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].input.content, "b");
        assert_eq!(blocks[0].response.content, "c");
        assert_eq!(blocks[1].input.content, "c");
        assert!(pair_blocks(&messages[..1]).is_empty());
    }

    #[test]
    fn personas_come_from_config_or_participants() {
        let [a, b] = resolve_personas(&[], &["Rui".into(), "Maria".into(), "Ana".into()]).unwrap();
        assert_eq!((a.name.as_str(), a.counterpart.as_str()), ("Rui", "Maria"));
        assert_eq!(b.counterpart, "Rui");

        let [a, _] = resolve_personas(&["Maria".into(), "Rui".into()], &["Rui".into()]).unwrap();
        assert_eq!(a.name, "Maria");

        assert!(matches!(
            resolve_personas(&[], &["Rui".into()]),
            Err(ConfigError::MissingPersonas { found: 1 })
        ));
    }

    #[test]
    fn renders_from_persona_perspective() {
        let block = InteractionBlock::pair(
            msg("Rui", 1_744_452_000_000, "Bom dia"),
            msg("Maria", 1_744_452_060_000, "Olá"),
        )
        .unwrap();
        let persona = Persona::new("Maria", "Rui");
        assert_eq!(
            render_for(&persona, &[block]),
            "[2025-04-12 10:00:00] Rui: Bom dia\n[2025-04-12 10:01:00] Me: Olá"
        );
    }

    #[test]
    fn look_back_window_drops_older_messages() {
        let mut conversation = Conversation {
            participants: vec![],
            messages: vec![
                msg("Maria", 1_743_465_600_000, "april 1st"),
                msg("Rui", 1_744_452_000_000, "april 12th"),
            ],
        };
        conversation.retain_since(NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(), 7);
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].content, "april 12th");
    }
}
