use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    Collaborators, CycleOutcome, CycleSettings, CycleStats, PersonaAnalyzer, RelationalSynthesizer,
};
use crate::store::Repository;
use crate::types::{InteractionBlock, Persona, RelationalRecord};

/// What one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub record: RelationalRecord,
    pub report_path: PathBuf,
    pub stats: [(Persona, CycleStats); 2],
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relational report for {}", self.record.date)?;
        for (persona, stats) in &self.stats {
            writeln!(
                f,
                "  {}: {} batches, {} analyzed, {} cached, {} failed, {} entries filtered",
                persona.name,
                stats.batches,
                stats.analyzed,
                stats.cached,
                stats.failed,
                stats.rejected
            )?;
        }
        let sections = [
            ("Strengths", &self.record.strengths),
            ("Challenges", &self.record.challenges),
            ("Advice", &self.record.advice),
        ];
        for (title, items) in sections {
            writeln!(f, "{title}:")?;
            if items.is_empty() {
                writeln!(f, "  (none)")?;
            }
            for item in items {
                writeln!(f, "  - {item}")?;
            }
        }
        write!(f, "Saved to {}", self.report_path.display())
    }
}

/// Runs both personas concurrently, then synthesizes and persists.
pub struct Pipeline {
    deps: Collaborators,
    repo: Arc<dyn Repository>,
    settings: CycleSettings,
}

impl Pipeline {
    pub fn new(deps: Collaborators, repo: Arc<dyn Repository>, settings: CycleSettings) -> Self {
        Self {
            deps,
            repo,
            settings,
        }
    }

    /// One full cycle. Model failures never fail the cycle; persistence
    /// failures and a crashed analysis task do.
    pub async fn run(
        &self,
        personas: [Persona; 2],
        blocks: Vec<InteractionBlock>,
    ) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("cycle", %run_id, date = %self.settings.reference_date);
        self.run_cycle(run_id, personas, blocks).instrument(span).await
    }

    async fn run_cycle(
        &self,
        run_id: Uuid,
        personas: [Persona; 2],
        blocks: Vec<InteractionBlock>,
    ) -> Result<CycleReport> {
        tracing::info!(blocks = blocks.len(), "cycle started");
        let blocks = Arc::new(blocks);
        let [first, second] = personas;
        let (a, b) = tokio::join!(
            self.spawn_analysis(first, blocks.clone()),
            self.spawn_analysis(second, blocks),
        );
        let a = a.context("persona analysis task failed")?;
        let b = b.context("persona analysis task failed")?;

        let mut synthesizer = RelationalSynthesizer::new(
            self.deps.model.clone(),
            self.deps.prompts.clone(),
            self.repo.load_relational(),
            self.settings,
        );
        let record = synthesizer
            .synthesize([&a.persona, &b.persona], [&a.feedback, &b.feedback])
            .await;

        for outcome in [&a, &b] {
            self.repo
                .save_persona(&outcome.persona, &outcome.memory)
                .with_context(|| format!("failed to save memory for {}", outcome.persona.name))?;
        }
        self.repo
            .save_relational(synthesizer.memory())
            .context("failed to save relational memory")?;
        let report_path = self
            .repo
            .write_report(&record)
            .context("failed to write report")?;

        tracing::info!(report = %report_path.display(), "cycle finished");
        Ok(CycleReport {
            run_id,
            record,
            report_path,
            stats: [(a.persona, a.stats), (b.persona, b.stats)],
        })
    }

    fn spawn_analysis(
        &self,
        persona: Persona,
        blocks: Arc<Vec<InteractionBlock>>,
    ) -> JoinHandle<CycleOutcome> {
        let stored = self.repo.load_persona(&persona);
        let span = tracing::info_span!("persona", name = %persona.name);
        let analyzer = PersonaAnalyzer::new(persona, stored, self.deps.clone(), self.settings);
        tokio::spawn(async move { analyzer.run_cycle(&blocks).await }.instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    use crate::llm::testing::ScriptedModel;
    use crate::prompts::DefaultPrompts;
    use crate::store::testing::MemoryRepository;
    use crate::types::Message;

    fn settings() -> CycleSettings {
        CycleSettings {
            budget: 3000,
            overlap: false,
            profile_budget: 3000,
            max_tokens: 100,
            temperature: 0.3,
            reference_date: NaiveDate::from_ymd_opt(2025, 4, 12).unwrap(),
        }
    }

    fn message(sender: &str, secs: i64, content: &str) -> Message {
        Message {
            sender: sender.into(),
            timestamp: Utc.timestamp_opt(1_744_452_000 + secs, 0).unwrap(),
            content: content.into(),
        }
    }

    fn blocks() -> Vec<InteractionBlock> {
        vec![
            InteractionBlock::pair(message("Rui", 0, "Bom dia"), message("Maria", 5, "Olá!"))
                .unwrap(),
            InteractionBlock::pair(message("Maria", 5, "Olá!"), message("Rui", 9, "Jantar?"))
                .unwrap(),
        ]
    }

    fn personas() -> [Persona; 2] {
        [Persona::new("Maria", "Rui"), Persona::new("Rui", "Maria")]
    }

    fn pipeline(model: Arc<ScriptedModel>, repo: Arc<MemoryRepository>) -> Pipeline {
        let deps = Collaborators {
            model,
            prompts: Arc::new(DefaultPrompts),
            cache: None,
        };
        Pipeline::new(deps, repo, settings())
    }

    fn profiled(repo: &MemoryRepository) {
        let mut personas = repo.personas.lock().unwrap();
        for slug in ["maria", "rui"] {
            personas.insert(slug.into(), json!({"personality_summary": "Sou calma."}));
        }
    }

    #[tokio::test]
    async fn cycle_persists_memories_and_report() {
        // Both analyses and the synthesis accept the same reply, so task
        // scheduling order does not matter.
        let reply = json!({
            "recent_reflections": [{"date": "2025-04-12", "text": "Eu sinto-me feliz"}],
            "strengths": ["Mutual trust"],
            "advice": "Keep the morning messages"
        })
        .to_string();
        let model = Arc::new(ScriptedModel::replying(&[&reply, &reply, &reply]));
        let repo = Arc::new(MemoryRepository::default());
        profiled(&repo);

        let report = pipeline(model.clone(), repo.clone())
            .run(personas(), blocks())
            .await
            .unwrap();

        assert_eq!(model.calls(), 3);
        assert_eq!(report.record.strengths, ["Mutual trust"]);
        assert_eq!(report.record.advice, ["Keep the morning messages"]);
        assert_eq!(report.stats[0].1.analyzed, 1);
        assert_eq!(report.stats[1].1.analyzed, 1);

        let personas = repo.personas.lock().unwrap();
        for slug in ["maria", "rui"] {
            assert_eq!(
                personas[slug]["recent_reflections"][0]["text"],
                json!("Eu sinto-me feliz")
            );
            assert_eq!(personas[slug]["personality_summary"], json!("Sou calma."));
        }
        let relational = repo.relational.lock().unwrap().clone().unwrap();
        assert_eq!(relational["history"].as_array().unwrap().len(), 1);
        assert!(relational["profiles"]["Maria"].is_object());
        assert_eq!(repo.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_model_still_completes_cycle() {
        let model = Arc::new(ScriptedModel::default());
        let repo = Arc::new(MemoryRepository::default());
        *repo.relational.lock().unwrap() = Some(json!({
            "history": [{"date": "2025-04-05", "strengths": ["trust"], "challenges": [], "advice": []}]
        }));

        let report = pipeline(model, repo.clone())
            .run(personas(), blocks())
            .await
            .unwrap();

        assert!(report.record.is_empty());
        assert_eq!(report.stats[0].1.failed, 1);
        let relational = repo.relational.lock().unwrap().clone().unwrap();
        assert_eq!(relational["history"].as_array().unwrap().len(), 2);
        assert_eq!(repo.personas.lock().unwrap().len(), 2);
        assert_eq!(repo.reports.lock().unwrap()[0], report.record);
    }

    #[test]
    fn summary_lists_sections() {
        let mut record = RelationalRecord::empty(settings().reference_date);
        record.strengths.push("Mutual trust".into());
        let report = CycleReport {
            run_id: Uuid::nil(),
            record,
            report_path: PathBuf::from("reports/report_2025-04-12.json"),
            stats: [
                (Persona::new("Maria", "Rui"), CycleStats::default()),
                (Persona::new("Rui", "Maria"), CycleStats::default()),
            ],
        };
        let text = report.to_string();
        assert!(text.contains("  - Mutual trust"));
        assert!(text.contains("Challenges:\n  (none)"));
        assert!(text.ends_with("reports/report_2025-04-12.json"));
    }
}
