//! Default [`CostCalculator`] implementation, backed by a small in-memory
//! pricing catalog (adapted from the teacher's LiteLLM model-info client).

use std::collections::BTreeMap;

use crate::{ports::CostCalculator, prelude::*};

/// Pricing for one model, as reported by a LiteLLM-compatible `/model/info`
/// endpoint (or supplied directly by the host).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelPrice {
    /// USD cost per prompt token.
    #[serde(default)]
    pub input_cost_per_token: f64,
    /// USD cost per completion token.
    #[serde(default)]
    pub output_cost_per_token: f64,
    /// USD cost per inline image, for providers that price vision
    /// separately from token counts.
    #[serde(default)]
    pub input_cost_per_image: f64,
}

/// A [`CostCalculator`] backed by a catalog of [`ModelPrice`]s seeded once
/// at construction.
///
/// Unknown models price at `0.0`; a missing catalog entry should never fail
/// a batch.
#[derive(Debug, Default)]
pub struct LiteLlmCostCalculator {
    catalog: BTreeMap<String, ModelPrice>,
}

impl LiteLlmCostCalculator {
    /// Build a calculator from a pre-fetched catalog (e.g. the `data` array
    /// of a LiteLLM `/model/info` response, reshaped by the host).
    pub fn new(catalog: BTreeMap<String, ModelPrice>) -> Self {
        Self { catalog }
    }

    /// A calculator with no pricing data; every call returns `0.0`. Useful
    /// for tests and for hosts that don't care about cost tracking.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add or overwrite one model's price.
    pub fn insert(&mut self, model_id: impl Into<String>, price: ModelPrice) {
        self.catalog.insert(model_id.into(), price);
    }
}

impl CostCalculator for LiteLlmCostCalculator {
    fn cost(&self, model_id: &str, prompt_tokens: u64, completion_tokens: u64, images: u32) -> f64 {
        let Some(price) = self.catalog.get(model_id) else {
            debug!(model_id, "no pricing entry; treating as zero-cost");
            return 0.0;
        };
        let input_cost = prompt_tokens as f64 * price.input_cost_per_token;
        let output_cost = completion_tokens as f64 * price.output_cost_per_token;
        let image_cost = images as f64 * price.input_cost_per_image;
        input_cost + output_cost + image_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_is_free() {
        let calc = LiteLlmCostCalculator::empty();
        assert_eq!(calc.cost("mystery-model", 1000, 500, 0), 0.0);
    }

    #[test]
    fn known_model_prices_tokens_and_images() {
        let mut calc = LiteLlmCostCalculator::empty();
        calc.insert(
            "gpt-4o",
            ModelPrice {
                input_cost_per_token: 0.000005,
                output_cost_per_token: 0.000015,
                input_cost_per_image: 0.001,
            },
        );
        let cost = calc.cost("gpt-4o", 1000, 500, 2);
        assert!((cost - (0.005 + 0.0075 + 0.002)).abs() < 1e-9);
    }
}
