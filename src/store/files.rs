use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use super::Repository;
use crate::memory::MemoryRecord;
use crate::types::{Persona, RelationalRecord};

/// JSON documents on disk: persona and relational memories under `data_dir`,
/// dated reports under `reports_dir`.
pub struct FileStore {
    data_dir: PathBuf,
    reports_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            reports_dir: reports_dir.into(),
        }
    }

    pub fn persona_path(&self, persona: &Persona) -> PathBuf {
        self.data_dir.join(format!("{}_memory.json", persona.slug()))
    }

    pub fn relational_path(&self) -> PathBuf {
        self.data_dir.join("relational_memory.json")
    }

    fn read(path: &Path) -> Option<Value> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no stored memory, starting empty");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable memory file, starting empty");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt memory file, starting empty");
                None
            }
        }
    }

    /// Pretty JSON written to a sibling temp file, then renamed into place.
    fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        tracing::info!(path = %path.display(), "saved");
        Ok(())
    }
}

impl Repository for FileStore {
    fn load_persona(&self, persona: &Persona) -> Option<Value> {
        Self::read(&self.persona_path(persona))
    }

    fn save_persona(&self, persona: &Persona, memory: &MemoryRecord) -> Result<()> {
        Self::write(&self.persona_path(persona), memory)
    }

    fn load_relational(&self) -> Option<Value> {
        Self::read(&self.relational_path())
    }

    fn save_relational(&self, memory: &MemoryRecord) -> Result<()> {
        Self::write(&self.relational_path(), memory)
    }

    fn write_report(&self, report: &RelationalRecord) -> Result<PathBuf> {
        let path = self
            .reports_dir
            .join(format!("report_{}.json", report.date.format("%Y-%m-%d")));
        Self::write(&path, report)?;
        Ok(path)
    }
}
