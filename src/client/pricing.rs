//! Model pricing and cost estimation.

use crate::types::Usage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model id or id prefix, matched case-insensitively.
    pub model: String,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

impl ModelPricing {
    pub fn new(model: &str, input: f64, output: f64) -> Self {
        Self {
            model: model.to_lowercase(),
            input_cost_per_1k: input,
            output_cost_per_1k: output,
        }
    }

    pub fn calculate_cost(&self, usage: &Usage) -> f64 {
        let ic = (usage.prompt_tokens as f64 / 1000.0) * self.input_cost_per_1k;
        let oc = (usage.completion_tokens as f64 / 1000.0) * self.output_cost_per_1k;
        ic + oc
    }
}

/// Price table used to turn token usage into a cost recorded against the daily budget.
///
/// Lookup picks the longest matching prefix, so `gpt-4-turbo-2024-04-09` resolves to
/// `gpt-4-turbo` rather than `gpt-4`. Unknown models cost nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    models: Vec<ModelPricing>,
}

impl Pricing {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self {
            models: vec![
                ModelPricing::new("gpt-4-turbo", 0.01, 0.03),
                ModelPricing::new("gpt-4", 0.03, 0.06),
                ModelPricing::new("gpt-3.5-turbo", 0.0005, 0.0015),
                ModelPricing::new("claude-3-opus", 0.015, 0.075),
                ModelPricing::new("claude-3-sonnet", 0.003, 0.015),
                ModelPricing::new("claude-3-5-sonnet", 0.003, 0.015),
                ModelPricing::new("claude-3-haiku", 0.00025, 0.00125),
                ModelPricing::new("gemini-pro", 0.00025, 0.0005),
                ModelPricing::new("gemini-1.5-pro", 0.00125, 0.005),
            ],
        }
    }

    /// Add or replace the entry for `pricing.model`.
    pub fn with_model(mut self, mut pricing: ModelPricing) -> Self {
        pricing.model = pricing.model.to_lowercase();
        self.models.retain(|m| m.model != pricing.model);
        self.models.push(pricing);
        self
    }

    pub fn for_model(&self, model: &str) -> Option<&ModelPricing> {
        let m = model.to_lowercase();
        self.models
            .iter()
            .filter(|p| m.starts_with(&p.model))
            .max_by_key(|p| p.model.len())
    }

    pub fn estimate(&self, model: &str, usage: &Usage) -> f64 {
        self.for_model(model)
            .map(|p| p.calculate_cost(usage))
            .unwrap_or(0.0)
    }
}
