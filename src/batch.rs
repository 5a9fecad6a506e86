//! Token-budget batching of conversation units.

use uuid::Uuid;

use crate::types::{InteractionBlock, Message};

/// Anything that can be rendered into prompt text and batched.
pub trait ConversationUnit {
    fn render(&self) -> String;
}

pub fn render_message(message: &Message, sender: &str) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        sender,
        message.content
    )
}

impl ConversationUnit for Message {
    fn render(&self) -> String {
        render_message(self, &self.sender)
    }
}

impl ConversationUnit for InteractionBlock {
    fn render(&self) -> String {
        format!("{}\n{}", self.input.render(), self.response.render())
    }
}

/// Cheap token estimate: about 0.75 words per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 4).div_ceil(3)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch<U> {
    /// Stable identity derived from the batch content.
    pub id: String,
    pub units: Vec<U>,
    /// Number of leading units carried over from the previous batch (0 or 1).
    pub overlap: usize,
    pub tokens: usize,
}

impl<U> Batch<U> {
    /// Units not already seen in the previous batch.
    pub fn fresh(&self) -> &[U] {
        &self.units[self.overlap..]
    }
}

struct Pending<U> {
    units: Vec<U>,
    texts: Vec<String>,
    costs: Vec<usize>,
    overlap: usize,
}

impl<U> Pending<U> {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            texts: Vec::new(),
            costs: Vec::new(),
            overlap: 0,
        }
    }

    fn tokens(&self) -> usize {
        self.costs.iter().sum()
    }

    fn push(&mut self, unit: U, text: String, cost: usize) {
        self.units.push(unit);
        self.texts.push(text);
        self.costs.push(cost);
    }

    fn finish(self) -> Batch<U> {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.texts.join("\n").as_bytes());
        Batch {
            id: format!("batch-{id}"),
            tokens: self.costs.iter().sum(),
            units: self.units,
            overlap: self.overlap,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBudgetBatcher {
    budget: usize,
    overlap: bool,
}

impl TokenBudgetBatcher {
    pub fn new(budget: usize, overlap: bool) -> Self {
        Self { budget, overlap }
    }

    /// Greedily pack `units` into batches of at most `budget` estimated tokens.
    ///
    /// A unit larger than the budget gets a batch of its own. With overlap
    /// enabled, each new batch is seeded with the last unit of the previous
    /// one whenever the seed still fits alongside the unit that forced the
    /// split.
    pub fn split<U: ConversationUnit + Clone>(&self, units: &[U]) -> Vec<Batch<U>> {
        let mut batches = Vec::new();
        let mut pending: Pending<U> = Pending::new();

        for unit in units {
            let text = unit.render();
            let cost = estimate_tokens(&text);

            if !pending.units.is_empty() && pending.tokens() + cost > self.budget {
                let closed = std::mem::replace(&mut pending, Pending::new());
                if self.overlap {
                    if let (Some(seed), Some(seed_text), Some(&seed_cost)) =
                        (closed.units.last(), closed.texts.last(), closed.costs.last())
                    {
                        if seed_cost + cost <= self.budget {
                            pending.push(seed.clone(), seed_text.clone(), seed_cost);
                            pending.overlap = 1;
                        }
                    }
                }
                batches.push(closed.finish());
            }
            pending.push(unit.clone(), text, cost);
        }

        if !pending.units.is_empty() {
            batches.push(pending.finish());
        }
        batches
    }
}
