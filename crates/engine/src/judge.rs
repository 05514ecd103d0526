use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::debug;

use dupcheck_core::{BatchCanceller, DupError, Judge, JudgeUsage, JudgeVerdict};
use dupcheck_llm::{LlmClient, LlmRequest, LlmResponse, TEXT_A_MARKER, TEXT_B_MARKER};

use crate::pricing::PricingRate;
use crate::text::{estimate_tokens, truncate_to_token_limit};

/// Completion size assumed when estimating the cost of a call.
pub const EXPECTED_COMPLETION_TOKENS: usize = 256;
const JUDGE_TEMPERATURE: f32 = 0.2;

const SYSTEM_PROMPT: &str = "You are an editor who finds duplicated articles. \
Always answer with a single JSON object and nothing else.";

const INSTRUCTIONS: &str = "Compare the two texts below and judge how much of their content is the same. \
Rewording, reordering and translation of the same facts still count as duplicated content.\n\
Respond with JSON: {\"similarity_score\": <number from 0 to 1>, \
\"duplicate_content\": \"<short description of the shared content>\", \
\"analysis\": \"<one or two sentences>\"}";

#[derive(Debug, Clone, Copy)]
pub struct JudgeOptions {
    pub max_tokens_per_text: usize,
    pub rate: PricingRate,
    pub batched: bool,
}

pub struct LlmJudge {
    client: LlmClient,
    options: JudgeOptions,
}

impl LlmJudge {
    pub fn new(client: LlmClient, options: JudgeOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &LlmClient {
        &self.client
    }
}

impl Judge for LlmJudge {
    fn estimate_cost(&self, left: &str, right: &str) -> f64 {
        estimate_call_cost(left, right, &self.options)
    }

    fn judge(&self, left: &str, right: &str) -> dupcheck_core::Result<JudgeVerdict> {
        judge_with(&|req| self.client.chat_blocking(req), left, right, &self.options)
            .map_err(|err| DupError::Judge(format!("{err:#}")))
    }
}

impl BatchCanceller for LlmJudge {
    fn cancel_batch(&self, batch_ref: &str) -> dupcheck_core::Result<bool> {
        self.client
            .cancel_batch_blocking(batch_ref)
            .map_err(|err| DupError::Judge(format!("{err:#}")))
    }
}

pub fn build_request(left: &str, right: &str, max_tokens_per_text: usize) -> LlmRequest {
    let left = truncate_to_token_limit(left.trim(), max_tokens_per_text);
    let right = truncate_to_token_limit(right.trim(), max_tokens_per_text);
    LlmRequest {
        system: Some(SYSTEM_PROMPT.to_string()),
        user: format!("{INSTRUCTIONS}\n\n{TEXT_A_MARKER}\n{left}\n\n{TEXT_B_MARKER}\n{right}\n[END]"),
        json_mode: true,
        temperature: Some(JUDGE_TEMPERATURE),
    }
}

pub fn estimate_call_cost(left: &str, right: &str, options: &JudgeOptions) -> f64 {
    let request = build_request(left, right, options.max_tokens_per_text);
    let prompt_tokens = estimate_tokens(&request.user)
        + request.system.as_deref().map(estimate_tokens).unwrap_or(0);
    let (input, output) = options.rate.cost(
        prompt_tokens as u64,
        EXPECTED_COMPLETION_TOKENS as u64,
        options.batched,
    );
    input + output
}

/// Runs one comparison through `chat` and prices the reported usage.
pub fn judge_with(
    chat: &dyn Fn(&LlmRequest) -> Result<LlmResponse>,
    left: &str,
    right: &str,
    options: &JudgeOptions,
) -> Result<JudgeVerdict> {
    let request = build_request(left, right, options.max_tokens_per_text);
    let response = chat(&request)?;
    let score = parse_similarity_score(&response.content)?;
    let (input_cost, output_cost) = options.rate.cost(
        response.prompt_tokens as u64,
        response.completion_tokens as u64,
        options.batched,
    );
    debug!(
        score,
        prompt_tokens = response.prompt_tokens,
        completion_tokens = response.completion_tokens,
        "judge verdict"
    );
    Ok(JudgeVerdict {
        score,
        usage: JudgeUsage {
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
            input_cost,
            output_cost,
            batched: options.batched,
        },
    })
}

/// Reads `similarity_score` from a judge reply, tolerating code fences around the JSON
/// and scores sent as strings.
pub fn parse_similarity_score(content: &str) -> Result<f32> {
    let trimmed = content.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| anyhow!("judge reply contains no JSON object"))?;
    let end = trimmed
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow!("judge reply contains no JSON object"))?;
    let value: Value = serde_json::from_str(&trimmed[start..=end])
        .map_err(|err| anyhow!("judge reply is not valid JSON: {err}"))?;
    let raw = value
        .get("similarity_score")
        .ok_or_else(|| anyhow!("judge reply has no similarity_score"))?;
    let score = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("similarity_score is not a number: {raw}"))?;
    if !score.is_finite() {
        return Err(anyhow!("similarity_score is not finite"));
    }
    Ok(score as f32)
}
