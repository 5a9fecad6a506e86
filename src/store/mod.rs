pub mod cache;
pub mod files;

use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;

use crate::memory::MemoryRecord;
use crate::types::{Persona, RelationalRecord};

pub use cache::BatchCache;
pub use files::FileStore;

/// Durable state read at cycle start and written at cycle end.
///
/// Loads return `None` both for a missing document and for one that cannot
/// be parsed; callers validate whatever comes back against their schema.
pub trait Repository: Send + Sync {
    fn load_persona(&self, persona: &Persona) -> Option<Value>;
    fn save_persona(&self, persona: &Persona, memory: &MemoryRecord) -> Result<()>;
    fn load_relational(&self) -> Option<Value>;
    fn save_relational(&self, memory: &MemoryRecord) -> Result<()>;
    /// Write the dated report, returning where it went.
    fn write_report(&self, report: &RelationalRecord) -> Result<PathBuf>;
}
