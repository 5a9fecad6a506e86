//! Per-persona analysis, relational synthesis and the cycle that runs them.

pub mod persona;
pub mod pipeline;
pub mod relational;

use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::Config;
use crate::llm::{CompletionModel, CompletionRequest};
use crate::prompts::PromptSource;
use crate::store::BatchCache;

pub use persona::{CycleOutcome, CycleStats, PersonaAnalyzer};
pub use pipeline::Pipeline;
pub use relational::RelationalSynthesizer;

/// Knobs shared by every component of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub budget: usize,
    pub overlap: bool,
    pub profile_budget: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub reference_date: NaiveDate,
}

impl CycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            budget: config.batch.budget,
            overlap: config.batch.overlap,
            profile_budget: config.batch.profile_budget,
            max_tokens: config.model.max_tokens,
            temperature: config.model.temperature,
            reference_date: config.reference_date(),
        }
    }

    pub fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest::new(prompt, self.max_tokens, self.temperature)
    }
}

/// Injected boundaries: the model, the prompt text and the optional cache.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn CompletionModel>,
    pub prompts: Arc<dyn PromptSource>,
    pub cache: Option<Arc<BatchCache>>,
}
