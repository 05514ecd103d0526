use serde::Deserialize;
use std::collections::HashMap;

use dupcheck_llm::LlmProvider;

/// Batch traffic is billed at half the synchronous rate unless configured otherwise.
const BATCH_DISCOUNT: f64 = 0.5;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default)]
    pub openai: HashMap<String, PricingEntry>,
    #[serde(default)]
    pub anthropic: HashMap<String, PricingEntry>,
    #[serde(default)]
    pub gemini: HashMap<String, PricingEntry>,
    #[serde(default)]
    pub deepseek: HashMap<String, PricingEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PricingEntry {
    pub prompt_per_1k: Option<f64>,
    pub completion_per_1k: Option<f64>,
    pub prompt_per_1m: Option<f64>,
    pub completion_per_1m: Option<f64>,
    pub batch_prompt_per_1m: Option<f64>,
    pub batch_completion_per_1m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingRate {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
    pub batch_prompt_per_1k: f64,
    pub batch_completion_per_1k: f64,
}

impl PricingRate {
    pub const FREE: PricingRate = PricingRate {
        prompt_per_1k: 0.0,
        completion_per_1k: 0.0,
        batch_prompt_per_1k: 0.0,
        batch_completion_per_1k: 0.0,
    };

    /// gpt-4o-mini list prices.
    pub const GPT_4O_MINI: PricingRate = PricingRate {
        prompt_per_1k: 0.15 / 1000.0,
        completion_per_1k: 0.60 / 1000.0,
        batch_prompt_per_1k: 0.075 / 1000.0,
        batch_completion_per_1k: 0.30 / 1000.0,
    };

    /// Returns `(input_cost, output_cost)` in USD.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64, batched: bool) -> (f64, f64) {
        let (prompt, completion) = if batched {
            (self.batch_prompt_per_1k, self.batch_completion_per_1k)
        } else {
            (self.prompt_per_1k, self.completion_per_1k)
        };
        (
            prompt_tokens as f64 / 1000.0 * prompt,
            completion_tokens as f64 / 1000.0 * completion,
        )
    }
}

impl PricingConfig {
    pub fn lookup(&self, provider: &str, model: &str) -> Option<PricingRate> {
        let model_key = model.to_string();
        match provider {
            "openai" => Self::lookup_entry(&self.openai, &model_key),
            "anthropic" => Self::lookup_entry(&self.anthropic, &model_key),
            "gemini" => Self::lookup_entry(&self.gemini, &model_key),
            "deepseek" => Self::lookup_entry(&self.deepseek, &model_key),
            _ => None,
        }
    }

    /// Configured rate, then built-in list prices, then gpt-4o-mini prices so spend is
    /// never under-counted as zero.
    pub fn rate_for(&self, provider: LlmProvider, model: &str) -> PricingRate {
        if provider == LlmProvider::Local {
            return PricingRate::FREE;
        }
        self.lookup(provider.as_str(), model)
            .or_else(|| builtin_rate(provider, model))
            .unwrap_or(PricingRate::GPT_4O_MINI)
    }

    fn lookup_entry(map: &HashMap<String, PricingEntry>, model: &str) -> Option<PricingRate> {
        map.get(model)
            .or_else(|| map.get(&model.to_lowercase()))
            .and_then(|entry| entry.normalized())
    }
}

fn builtin_rate(provider: LlmProvider, model: &str) -> Option<PricingRate> {
    match (provider, model.to_lowercase().as_str()) {
        (LlmProvider::OpenAi, "gpt-4o-mini") => Some(PricingRate::GPT_4O_MINI),
        _ => None,
    }
}

impl PricingEntry {
    pub fn normalized(&self) -> Option<PricingRate> {
        let prompt = self
            .prompt_per_1k
            .or_else(|| self.prompt_per_1m.map(|value| value / 1000.0));
        let completion = self
            .completion_per_1k
            .or_else(|| self.completion_per_1m.map(|value| value / 1000.0));
        if prompt.is_none() && completion.is_none() {
            return None;
        }
        let prompt = prompt.unwrap_or(0.0);
        let completion = completion.unwrap_or(0.0);
        Some(PricingRate {
            prompt_per_1k: prompt,
            completion_per_1k: completion,
            batch_prompt_per_1k: self
                .batch_prompt_per_1m
                .map(|value| value / 1000.0)
                .unwrap_or(prompt * BATCH_DISCOUNT),
            batch_completion_per_1k: self
                .batch_completion_per_1m
                .map(|value| value / 1000.0)
                .unwrap_or(completion * BATCH_DISCOUNT),
        })
    }
}
