use anyhow::{anyhow, Context, Result};
use reqwest::{header::HeaderValue, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::env;
use tokio::runtime::Runtime;
use tokio::time::{sleep, Duration};

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Markers the judge prompt places around the two texts under comparison.
pub const TEXT_A_MARKER: &str = "[TEXT A]";
pub const TEXT_B_MARKER: &str = "[TEXT B]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Gemini,
    Deepseek,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Gemini => "gemini",
            LlmProvider::Deepseek => "deepseek",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            "gemini" => Some(LlmProvider::Gemini),
            "deepseek" => Some(LlmProvider::Deepseek),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    /// Environment variable holding the provider's API key.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::Gemini => Some("GEMINI_API_KEY"),
            LlmProvider::Deepseek => Some("DEEPSEEK_API_KEY"),
            LlmProvider::Local => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    /// Ask the provider for a single JSON object.
    pub json_mode: bool,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
    max_retries: usize,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAi(OpenAiConfig),
    Anthropic(AnthropicConfig),
    Gemini(GeminiConfig),
    Deepseek(DeepseekConfig),
    Local,
}

#[derive(Clone)]
struct OpenAiConfig {
    api_key: String,
    base_url: String,
}

#[derive(Clone)]
struct AnthropicConfig {
    api_key: String,
    max_tokens: u32,
}

#[derive(Clone)]
struct GeminiConfig {
    api_key: String,
}

#[derive(Clone)]
struct DeepseekConfig {
    api_key: String,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        Self::with_timeout(provider, model, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        provider: LlmProvider,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let model = model.into();
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Anthropic => ProviderConfig::Anthropic(AnthropicConfig {
                api_key: read_api_key("ANTHROPIC_API_KEY")?,
                max_tokens: env::var("ANTHROPIC_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(512),
            }),
            LlmProvider::Gemini => ProviderConfig::Gemini(GeminiConfig {
                api_key: read_api_key("GEMINI_API_KEY")?,
            }),
            LlmProvider::Deepseek => ProviderConfig::Deepseek(DeepseekConfig {
                api_key: read_api_key("DEEPSEEK_API_KEY")?,
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::OpenAi(cfg) => self.chat_openai(cfg, req).await,
            ProviderConfig::Anthropic(cfg) => self.chat_anthropic(cfg, req).await,
            ProviderConfig::Gemini(cfg) => self.chat_gemini(cfg, req).await,
            ProviderConfig::Deepseek(cfg) => self.chat_deepseek(cfg, req).await,
            ProviderConfig::Local => Ok(self.chat_local(req)),
        }
    }

    pub fn chat_blocking(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let rt = Runtime::new().context("failed to create tokio runtime")?;
        rt.block_on(self.chat(req))
    }

    /// Cancels an asynchronous batch job. Providers without a batch API report `false`.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<bool> {
        let ProviderConfig::OpenAi(cfg) = &self.config else {
            return Ok(false);
        };
        let url = format!(
            "{}/batches/{}/cancel",
            cfg.base_url.trim_end_matches('/'),
            batch_id
        );
        let response = self
            .send_with_retry("openai batch cancel", || {
                self.http.post(&url).bearer_auth(&cfg.api_key)
            })
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "openai batch cancel failed (status {status}): {body}"
            ));
        }
        Ok(true)
    }

    pub fn cancel_batch_blocking(&self, batch_id: &str) -> Result<bool> {
        let rt = Runtime::new().context("failed to create tokio runtime")?;
        rt.block_on(self.cancel_batch(batch_id))
    }

    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match build().send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > self.max_retries || err.is_timeout() {
                        return Err(err).with_context(|| format!("{label} request failed"));
                    }
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt > self.max_retries {
                    return Err(anyhow!(
                        "{label} still failing with status {status} after {} retries",
                        self.max_retries
                    ));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                sleep(wait).await;
                continue;
            }
            return Ok(response);
        }
    }

    async fn chat_openai(&self, cfg: &OpenAiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let payload = chat_payload(&self.model, req);
        let response = self
            .send_with_retry("openai", || {
                self.http.post(&url).bearer_auth(&cfg.api_key).json(&payload)
            })
            .await?;
        let value = decode_json_body("openai", response).await?;
        chat_completion_response(&value, "OpenAI")
    }

    async fn chat_deepseek(&self, cfg: &DeepseekConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let payload = chat_payload(&self.model, req);
        let response = self
            .send_with_retry("deepseek", || {
                self.http
                    .post("https://api.deepseek.com/v1/chat/completions")
                    .bearer_auth(&cfg.api_key)
                    .json(&payload)
            })
            .await?;
        let value = decode_json_body("deepseek", response).await?;
        chat_completion_response(&value, "DeepSeek")
    }

    async fn chat_anthropic(&self, cfg: &AnthropicConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": cfg.max_tokens,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        // No JSON response mode here; the prompt itself asks for a JSON object.
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        if let Some(temperature) = req.temperature {
            payload["temperature"] = json!(temperature);
        }
        let response = self
            .send_with_retry("anthropic", || {
                self.http
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", &cfg.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&payload)
            })
            .await?
            .error_for_status()
            .context("anthropic returned an error")?
            .json::<AnthropicResponse>()
            .await
            .context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }

    async fn chat_gemini(&self, cfg: &GeminiConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let mut prompt = String::new();
        if let Some(system) = &req.system {
            prompt.push_str("[SYSTEM]\n");
            prompt.push_str(system.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str(&req.user);
        let mut generation = serde_json::Map::new();
        if req.json_mode {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(temperature) = req.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        let payload = json!({
            "contents": [ { "parts": [ { "text": prompt } ] } ],
            "generationConfig": Value::Object(generation),
        });
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, cfg.api_key
        );
        let response = self
            .send_with_retry("gemini", || self.http.post(&url).json(&payload))
            .await?
            .error_for_status()
            .context("gemini returned an error")?
            .json::<GeminiResponse>()
            .await
            .context("failed to decode gemini response")?;
        let text = response
            .candidates
            .and_then(|mut c| c.pop())
            .and_then(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .find_map(|part| part.text)
            })
            .ok_or_else(|| anyhow!("missing text in Gemini response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    fn chat_local(&self, req: &LlmRequest) -> LlmResponse {
        let content = synthesize_local_response(req);
        LlmResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

fn chat_payload(model: &str, req: &LlmRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": req.user }));
    let mut payload = json!({
        "model": model,
        "messages": messages,
    });
    if req.json_mode {
        payload["response_format"] = json!({ "type": "json_object" });
    }
    if let Some(temperature) = req.temperature {
        payload["temperature"] = json!(temperature);
    }
    payload
}

fn chat_completion_response(value: &Value, provider: &str) -> Result<LlmResponse> {
    let content = extract_chat_text(value)
        .ok_or_else(|| anyhow!("missing text in {provider} response"))?;
    let usage: ChatUsage = value
        .get("usage")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default();
    Ok(LlmResponse {
        content,
        prompt_tokens: usage.prompt_tokens.unwrap_or(0),
        completion_tokens: usage.completion_tokens.unwrap_or(0),
    })
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(6) as u32;
    Duration::from_secs(1u64 << capped)
}

/// Offline stand-in: scores a judge prompt by word overlap between the two marked texts.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let (Some(left), Some(right)) = (
        extract_context_block(&req.user, TEXT_A_MARKER, TEXT_B_MARKER),
        extract_context_block(&req.user, TEXT_B_MARKER, "\n[END]"),
    ) else {
        return summarize_text(&req.user, 40);
    };
    let score = word_overlap(&left, &right);
    json!({
        "similarity_score": (score * 1000.0).round() / 1000.0,
        "duplicate_content": summarize_text(&left, 12),
        "analysis": format!("local word-overlap estimate over {} and {} words",
            left.split_whitespace().count(),
            right.split_whitespace().count()),
    })
    .to_string()
}

fn word_overlap(left: &str, right: &str) -> f64 {
    let words = |text: &str| -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    };
    let a = words(left);
    let b = words(right);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

async fn decode_json_body(label: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{label} returned error (status {status}): {body}"));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {label} response"))
}

fn extract_context_block(text: &str, start_marker: &str, stop_marker: &str) -> Option<String> {
    let start_idx = text.find(start_marker)?;
    let after = &text[start_idx + start_marker.len()..];
    let segment = match after.find(stop_marker) {
        Some(end_idx) => &after[..end_idx],
        None => after,
    };
    Some(segment.trim().to_string())
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!("{var} is not set"))?;
    validate_api_key(var, &value)?;
    Ok(value)
}

/// Checks the key's shape without contacting the provider.
pub fn validate_api_key(var: &str, value: &str) -> Result<()> {
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(anyhow!(
            "{var} must start with 'sk-' (see https://platform.openai.com/)"
        ));
    }
    if var.contains("ANTHROPIC") && !value.starts_with("sk-ant-") {
        return Err(anyhow!("{var} must start with 'sk-ant-'"));
    }
    if var.contains("DEEPSEEK") && !value.starts_with("sk-") {
        return Err(anyhow!("{var} must start with 'sk-'"));
    }
    if var.contains("GEMINI") && !value.starts_with("AI") {
        return Err(anyhow!(
            "{var} must be a valid Gemini API key (starts with 'AI...')"
        ));
    }
    Ok(())
}

fn extract_chat_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

#[derive(Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_tokens: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    completion_tokens: Option<u32>,
}
