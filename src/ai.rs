use std::{env, time::Duration};

use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::models::SelectedArticle;
use crate::prompt::Prompt;
use crate::runlog::RunLogger;
use crate::settings::EngineSettings;
use crate::utils::snippet;

pub const HEADLINES_LABEL: &str = "headlines-only";
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_TRIES_PER_PROVIDER: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const ERROR_SNIPPET_MAX: usize = 500;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// Model ids with these prefixes take the single-instruction "responses"
/// request shape; everything else is role-tagged chat.
const DEFAULT_RESPONSES_PREFIXES: &[&str] = &["gpt-5", "o3", "o4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    Chat,
    Responses,
}

#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub model_id: String,
    pub reasoning_effort: Option<String>,
    pub max_output_tokens: u32,
}

impl ProviderAttempt {
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider_id, self.model_id)
    }

    /// "provider:model" as stored in settings.
    fn parse(spec: &str, reasoning: &str) -> Option<Self> {
        let (provider_id, model_id) = spec.split_once(':')?;
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            reasoning_effort: Some(reasoning.to_string()),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub attempts: Vec<ProviderAttempt>,
    pub responses_prefixes: Vec<String>,
    pub attempt_timeout: Duration,
}

impl CascadeConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut attempts = Vec::new();
        for spec in [&settings.primary_model, &settings.secondary_model]
            .into_iter()
            .flatten()
        {
            if let Some(attempt) = ProviderAttempt::parse(spec, &settings.reasoning_level) {
                attempts.push(attempt);
            }
        }
        Self {
            attempts,
            responses_prefixes: DEFAULT_RESPONSES_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

pub fn request_shape(model_id: &str, prefixes: &[String]) -> RequestShape {
    if prefixes.iter().any(|p| model_id.starts_with(p.as_str())) {
        RequestShape::Responses
    } else {
        RequestShape::Chat
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network: {0}")]
    Network(String),
    #[error("empty model output")]
    Empty,
    #[error("missing credential {0}")]
    MissingKey(String),
}

impl ProviderError {
    /// Only throttling, server errors, and network faults are worth a
    /// retry; other 4xx fail the provider immediately.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::Empty | ProviderError::MissingKey(_) => false,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiSuccess {
    pub text: String,
    pub provider_label: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeFailure {
    Exhausted,
    Cancelled,
}

fn base_url(provider_id: &str) -> String {
    let override_key = format!("{}_BASE_URL", provider_id.to_ascii_uppercase());
    if let Ok(url) = env::var(&override_key) {
        return url;
    }
    match provider_id {
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

fn api_key(provider_id: &str) -> Option<String> {
    env::var(format!("{}_API_KEY", provider_id.to_ascii_uppercase()))
        .ok()
        .filter(|k| !k.is_empty())
}

/// Provider-agnostic request shaping.
pub fn build_request(attempt: &ProviderAttempt, prompt: &Prompt, prefixes: &[String]) -> (String, Value) {
    match request_shape(&attempt.model_id, prefixes) {
        RequestShape::Chat => (
            format!("{}/chat/completions", base_url(&attempt.provider_id)),
            json!({
                "model": attempt.model_id,
                "messages": [
                    {"role": "system", "content": prompt.system},
                    {"role": "user", "content": prompt.user},
                ],
                "temperature": 0.7,
                "max_tokens": attempt.max_output_tokens,
            }),
        ),
        RequestShape::Responses => {
            let mut body = json!({
                "model": attempt.model_id,
                "instructions": prompt.system,
                "input": prompt.user,
                "max_output_tokens": attempt.max_output_tokens,
            });
            if let Some(effort) = &attempt.reasoning_effort {
                body["reasoning"] = json!({"effort": effort});
            }
            (format!("{}/responses", base_url(&attempt.provider_id)), body)
        }
    }
}

/// Pull the generated text out of either response shape. Whitespace-only
/// output counts as nothing.
pub fn parse_output_text(shape: RequestShape, resp: &Value) -> Option<String> {
    let text = match shape {
        RequestShape::Chat => resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string),
        RequestShape::Responses => {
            let direct = resp
                .get("output_text")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string);
            direct.or_else(|| {
                let mut parts = Vec::new();
                for item in resp.get("output")?.as_array()? {
                    let Some(content) = item.get("content").and_then(Value::as_array) else {
                        continue;
                    };
                    for part in content {
                        if let Some(s) = part.get("text").and_then(Value::as_str) {
                            parts.push(s.to_string());
                        }
                    }
                }
                Some(parts.concat())
            })
        }
    }?;
    if text.trim().is_empty() { None } else { Some(text) }
}

pub fn parse_token_usage(shape: RequestShape, resp: &Value) -> (i64, i64) {
    let (in_key, out_key) = match shape {
        RequestShape::Chat => ("/usage/prompt_tokens", "/usage/completion_tokens"),
        RequestShape::Responses => ("/usage/input_tokens", "/usage/output_tokens"),
    };
    (
        resp.pointer(in_key).and_then(Value::as_i64).unwrap_or(0),
        resp.pointer(out_key).and_then(Value::as_i64).unwrap_or(0),
    )
}

async fn call_once(
    http: &Client,
    url: &str,
    key: &str,
    body: &Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let resp = http
        .post(url)
        .bearer_auth(key)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: snippet(&text, ERROR_SNIPPET_MAX),
        });
    }
    resp.json::<Value>()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))
}

/// One provider, up to three tries with exponential backoff. Never logs the
/// request body; only status + response prefix on failure.
async fn call_provider(
    http: &Client,
    attempt: &ProviderAttempt,
    prompt: &Prompt,
    cfg: &CascadeConfig,
) -> Result<AiSuccess, ProviderError> {
    let key = api_key(&attempt.provider_id)
        .ok_or_else(|| ProviderError::MissingKey(format!("{}_API_KEY", attempt.provider_id.to_ascii_uppercase())))?;

    let shape = request_shape(&attempt.model_id, &cfg.responses_prefixes);
    let (url, body) = build_request(attempt, prompt, &cfg.responses_prefixes);

    let mut last_err = ProviderError::Empty;
    for try_no in 0..MAX_TRIES_PER_PROVIDER {
        if try_no > 0 {
            sleep(Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(try_no - 1))).await;
        }
        match call_once(http, &url, &key, &body, cfg.attempt_timeout).await {
            Ok(resp) => {
                let Some(text) = parse_output_text(shape, &resp) else {
                    return Err(ProviderError::Empty);
                };
                let (tokens_in, tokens_out) = parse_token_usage(shape, &resp);
                return Ok(AiSuccess {
                    text,
                    provider_label: attempt.label(),
                    tokens_in,
                    tokens_out,
                });
            }
            Err(e) if e.retryable() => last_err = e,
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Walk the configured cascade until a provider produces text. Failures log
/// `ai.failed` and advance; the first success logs `ai.result` and returns.
pub async fn run_cascade<F>(
    http: &Client,
    cfg: &CascadeConfig,
    prompt: &Prompt,
    logger: &RunLogger,
    cancelled: F,
) -> Result<AiSuccess, CascadeFailure>
where
    F: Fn() -> bool,
{
    for attempt in &cfg.attempts {
        if cancelled() {
            return Err(CascadeFailure::Cancelled);
        }
        match call_provider(http, attempt, prompt, cfg).await {
            Ok(success) => {
                logger.info(
                    "ai.result",
                    Some(json!({
                        "provider_id": attempt.provider_id,
                        "model_id": attempt.model_id,
                        "tokens_in": success.tokens_in,
                        "tokens_out": success.tokens_out,
                    })),
                );
                return Ok(success);
            }
            Err(e) => {
                logger.warn(
                    "ai.failed",
                    Some(json!({
                        "provider_id": attempt.provider_id,
                        "model_id": attempt.model_id,
                        "status": e.status(),
                        "error": snippet(&e.to_string(), ERROR_SNIPPET_MAX),
                    })),
                );
            }
        }
    }
    Err(CascadeFailure::Exhausted)
}

/// Deterministic headlines-only document used when every provider failed
/// (or none is configured).
pub fn headlines_fallback(selected: &[SelectedArticle]) -> String {
    let mut md = String::from("### Headlines\n\n");
    for s in selected.iter().take(12) {
        md.push_str(&format!(
            "- **{}** — [{}]({})\n",
            s.item.title, s.item.source, s.item.canonical_url
        ));
    }
    if selected.is_empty() {
        md.push_str("- No new stories were found for this run.\n");
    }
    md
}
