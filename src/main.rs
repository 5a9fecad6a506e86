mod analysis;
mod batch;
mod config;
mod conversation;
mod error;
mod llm;
mod memory;
mod prompts;
mod repair;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use analysis::{Collaborators, CycleSettings, Pipeline};
use config::{Cli, Config};
use error::ConfigError;
use llm::HttpModel;
use prompts::DefaultPrompts;
use store::{BatchCache, FileStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relational_memory=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;
    let settings = CycleSettings::from_config(&config);

    let mut conversation = conversation::load_exports(&config.exports_dir, &config.aliases)?;
    if let Some(days) = config.since_days {
        conversation.retain_since(settings.reference_date, days);
    }
    let blocks = conversation::pair_blocks(&conversation.messages);
    if blocks.is_empty() {
        return Err(ConfigError::NoInteractions.into());
    }
    let personas = conversation::resolve_personas(&config.personas, &conversation.participants)?;
    info!(
        blocks = blocks.len(),
        personas = %format!("{} & {}", personas[0].name, personas[1].name),
        "conversation ready"
    );

    let cache = if config.batch.cache {
        match BatchCache::open(&config.cache_path()) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "batch cache unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let deps = Collaborators {
        model: Arc::new(HttpModel::new(&config.model)),
        prompts: Arc::new(DefaultPrompts),
        cache,
    };
    let repo = Arc::new(FileStore::new(&config.data_dir, &config.reports_dir));
    let pipeline = Pipeline::new(deps, repo, settings);

    let report = pipeline.run(personas, blocks).await?;
    info!(run_id = %report.run_id, "run complete");
    println!("{report}");
    Ok(())
}
