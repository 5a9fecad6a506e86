//! Run configuration: defaults, then an optional YAML file, then environment
//! variables, then command-line flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Parser, Debug, Default)]
#[command(
    name = "relational-memory",
    about = "Distill persona memories and a relational report from exported chat logs"
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, env = "RELATIONAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the conversation export JSON files
    #[arg(long)]
    pub exports: Option<PathBuf>,

    /// Directory for persona memories, relational memory and the batch cache
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for dated report files
    #[arg(long)]
    pub reports_dir: Option<PathBuf>,

    /// Date stamped on reflections and reports (YYYY-MM-DD, default today)
    #[arg(long)]
    pub reference_date: Option<NaiveDate>,

    /// Only analyze messages from the last N days before the reference date
    #[arg(long)]
    pub since_days: Option<u32>,

    /// Token budget per batch
    #[arg(long)]
    pub budget: Option<usize>,

    /// Carry the last block of each batch into the next one
    #[arg(long)]
    pub overlap: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub exports_dir: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// The two persona names. Empty means the first two export participants.
    pub personas: Vec<String>,
    /// Raw export name -> canonical persona name.
    pub aliases: BTreeMap<String, String>,
    pub reference_date: Option<NaiveDate>,
    pub since_days: Option<u32>,
    pub model: ModelConfig,
    pub batch: BatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exports_dir: PathBuf::from("data"),
            data_dir: PathBuf::from("data"),
            reports_dir: PathBuf::from("reports"),
            personas: Vec::new(),
            aliases: BTreeMap::new(),
            reference_date: None,
            since_days: None,
            model: ModelConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible server.
    pub url: String,
    pub name: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call timeout.
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:1234".to_string(),
            name: "llama-3.2-1b-instruct".to_string(),
            api_key: None,
            temperature: 0.3,
            max_tokens: 1000,
            timeout_secs: 120,
            max_retries: 3,
            retry_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Estimated tokens per analysis batch.
    pub budget: usize,
    pub overlap: bool,
    /// Estimated tokens of conversation used to bootstrap an empty profile.
    pub profile_budget: usize,
    /// Reuse feedback cached by earlier runs for identical batches.
    pub cache: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            budget: 3000,
            overlap: false,
            profile_budget: 3000,
            cache: true,
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, e.to_string()))
}

impl Config {
    /// Defaults overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Full resolution for a run: file, process environment, flags, validation.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("MODEL_URL") {
            self.model.url = v;
        }
        if let Some(v) = lookup("MODEL_NAME") {
            self.model.name = v;
        }
        if let Some(v) = lookup("MODEL_API_KEY") {
            self.model.api_key = Some(v);
        }
        if let Some(v) = lookup("MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_env("MODEL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RELATIONAL_EXPORTS_DIR") {
            self.exports_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELATIONAL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELATIONAL_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELATIONAL_BATCH_BUDGET") {
            self.batch.budget = parse_env("RELATIONAL_BATCH_BUDGET", &v)?;
        }
        let a = lookup("PERSONA_A");
        let b = lookup("PERSONA_B");
        if let (Some(a), Some(b)) = (a, b) {
            self.personas = vec![a, b];
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.exports {
            self.exports_dir = dir.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(dir) = &cli.reports_dir {
            self.reports_dir = dir.clone();
        }
        if cli.reference_date.is_some() {
            self.reference_date = cli.reference_date;
        }
        if cli.since_days.is_some() {
            self.since_days = cli.since_days;
        }
        if let Some(budget) = cli.budget {
            self.batch.budget = budget;
        }
        if cli.overlap {
            self.batch.overlap = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.budget == 0 {
            return Err(invalid("batch.budget", "must be greater than zero"));
        }
        if self.batch.profile_budget == 0 {
            return Err(invalid("batch.profile_budget", "must be greater than zero"));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(invalid("model.temperature", "must be within [0, 2]"));
        }
        if self.model.timeout_secs == 0 {
            return Err(invalid("model.timeout_secs", "a per-call timeout is required"));
        }
        match self.personas.as_slice() {
            [] => {}
            [a, b] if a.trim().eq_ignore_ascii_case(b.trim()) => {
                return Err(invalid("personas", "the two personas must differ"));
            }
            [_, _] => {}
            other => {
                return Err(invalid(
                    "personas",
                    format!("expected two names, got {}", other.len()),
                ));
            }
        }
        Ok(())
    }

    /// The configured date, or today in local time.
    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("batch_cache.db")
    }
}
