use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, RetryConfig};
use crate::definition::{OnInsufficient, ReviewSettings};
use crate::error::{OrchError, OrchResult};
use crate::{log_debug, log_info};

// --- Error taxonomy ---

/// Classified executor failures. Permanent errors stop the dispatch
/// immediately; transient ones are retried and may cascade to fallbacks.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewErrorType {
    KeyMissing,
    KeyInvalid,
    RateLimited,
    NetworkError,
    Timeout,
    ParseError,
    ReviewFailed,
}

impl ReviewErrorType {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReviewErrorType::KeyMissing | ReviewErrorType::KeyInvalid)
    }

    /// Severity rank for picking the worst error across an exhausted chain.
    fn severity(&self) -> u8 {
        match self {
            ReviewErrorType::KeyMissing => 6,
            ReviewErrorType::KeyInvalid => 5,
            ReviewErrorType::ReviewFailed => 4,
            ReviewErrorType::ParseError => 3,
            ReviewErrorType::NetworkError => 2,
            ReviewErrorType::RateLimited => 1,
            ReviewErrorType::Timeout => 0,
        }
    }

    /// Attempts allowed for this error class within a single model:
    /// permanent stops at 1, parse errors get a single retry, transient
    /// errors use the configured cap.
    fn attempt_cap(&self, configured: u32) -> u32 {
        match self {
            e if e.is_permanent() => 1,
            ReviewErrorType::ParseError => 2,
            ReviewErrorType::ReviewFailed => 1,
            _ => configured,
        }
    }

    pub fn remediation_hint(&self, api_key_env: Option<&str>) -> Option<String> {
        match self {
            ReviewErrorType::KeyMissing | ReviewErrorType::KeyInvalid => Some(format!(
                "Re-provision the API key in {}",
                api_key_env.unwrap_or("the provider's key environment variable")
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReviewErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewErrorType::KeyMissing => "KEY_MISSING",
            ReviewErrorType::KeyInvalid => "KEY_INVALID",
            ReviewErrorType::RateLimited => "RATE_LIMITED",
            ReviewErrorType::NetworkError => "NETWORK_ERROR",
            ReviewErrorType::Timeout => "TIMEOUT",
            ReviewErrorType::ParseError => "PARSE_ERROR",
            ReviewErrorType::ReviewFailed => "REVIEW_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Classify an HTTP status plus message into the taxonomy.
pub fn classify_status(status: u16, message: &str) -> ReviewErrorType {
    let lowered = message.to_lowercase();
    match status {
        401 | 403 => ReviewErrorType::KeyInvalid,
        429 => ReviewErrorType::RateLimited,
        s if s >= 500 => ReviewErrorType::NetworkError,
        _ if lowered.contains("invalid api key") => ReviewErrorType::KeyInvalid,
        _ if lowered.contains("timed out") || lowered.contains("timeout") => {
            ReviewErrorType::Timeout
        }
        _ => ReviewErrorType::NetworkError,
    }
}

// --- Request / result types ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ReviewContext {
    pub diff: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase_notes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReviewRequest {
    pub review_type: String,
    pub context: ReviewContext,
    pub primary_model: String,
    pub fallback_chain: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReviewFinding {
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub blocking: bool,
}

/// What an executor returns on success.
#[derive(Clone, Debug, Default)]
pub struct ExecutorResponse {
    pub raw_output: String,
    pub findings: Vec<ReviewFinding>,
    /// Provider usage accounting, passed through opaquely.
    pub usage: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct ExecutorError {
    pub error_type: ReviewErrorType,
    pub message: String,
}

impl ExecutorError {
    pub fn new(error_type: ReviewErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ReviewResult {
    pub success: bool,
    pub review_type: String,
    pub model: Option<String>,
    pub was_fallback: bool,
    pub fallback_reason: Option<String>,
    pub fallbacks_tried: Vec<String>,
    pub error_type: Option<ReviewErrorType>,
    pub findings: Vec<ReviewFinding>,
    pub raw_output: Option<String>,
}

// --- Executor trait ---

/// One opaque review endpoint. Enables mocking in router tests.
pub trait ReviewExecutor: Send + Sync {
    fn call(
        &self,
        review_type: &str,
        context: &ReviewContext,
        model: &str,
    ) -> impl std::future::Future<Output = Result<ExecutorResponse, ExecutorError>> + Send;
}

// --- Router ---

/// Dispatches review requests across a fallback chain with retry.
///
/// Stateless beyond a counter of fallbacks used, kept for session
/// reporting.
pub struct ReviewRouter<E: ReviewExecutor> {
    executor: E,
    retry: RetryConfig,
    fallbacks_used: AtomicU32,
}

impl<E: ReviewExecutor> ReviewRouter<E> {
    pub fn new(executor: E, retry: RetryConfig) -> Self {
        Self {
            executor,
            retry,
            fallbacks_used: AtomicU32::new(0),
        }
    }

    pub fn fallbacks_used(&self) -> u32 {
        self.fallbacks_used.load(Ordering::Relaxed)
    }

    /// Run the request against the primary, cascading through the fallback
    /// chain on transient exhaustion. Permanent errors stop the dispatch:
    /// a dead key is dead on every retry, and silently consuming a
    /// fallback would mask the misconfiguration.
    pub async fn dispatch(
        &self,
        request: &ReviewRequest,
        max_fallback_attempts: u32,
        cancel: &CancellationToken,
    ) -> OrchResult<ReviewResult> {
        let chain: Vec<&str> = std::iter::once(request.primary_model.as_str())
            .chain(
                request
                    .fallback_chain
                    .iter()
                    .take(max_fallback_attempts as usize)
                    .map(String::as_str),
            )
            .collect();

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ExecutorError> = None;
        let mut worst: Option<ReviewErrorType> = None;

        for (index, model) in chain.iter().enumerate() {
            if index > 0 {
                self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
                log_info!(
                    "[review:{}] falling back to '{}' after {}",
                    request.review_type,
                    model,
                    last_error
                        .as_ref()
                        .map(|e| e.error_type.to_string())
                        .unwrap_or_default()
                );
            }
            tried.push(model.to_string());

            match self.call_with_retry(request, model, cancel).await? {
                Ok(response) => {
                    return Ok(ReviewResult {
                        success: true,
                        review_type: request.review_type.clone(),
                        model: Some(model.to_string()),
                        was_fallback: index > 0,
                        fallback_reason: last_error
                            .as_ref()
                            .map(|e| format!("{}: {}", e.error_type, e.message)),
                        fallbacks_tried: tried[..tried.len() - 1].to_vec(),
                        error_type: None,
                        findings: response.findings,
                        raw_output: Some(response.raw_output),
                    });
                }
                Err(err) => {
                    worst = Some(match worst {
                        Some(w) if w.severity() >= err.error_type.severity() => w,
                        _ => err.error_type,
                    });
                    let permanent = err.error_type.is_permanent();
                    last_error = Some(err);
                    if permanent {
                        break;
                    }
                }
            }
        }

        Ok(ReviewResult {
            success: false,
            review_type: request.review_type.clone(),
            model: None,
            was_fallback: tried.len() > 1,
            fallback_reason: last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.error_type, e.message)),
            fallbacks_tried: tried,
            error_type: worst,
            findings: Vec::new(),
            raw_output: None,
        })
    }

    /// Retry one model with exponential backoff and jitter. Stops on
    /// permanent errors immediately; parse errors get a single retry.
    async fn call_with_retry(
        &self,
        request: &ReviewRequest,
        model: &str,
        cancel: &CancellationToken,
    ) -> OrchResult<Result<ExecutorResponse, ExecutorError>> {
        let call_timeout = Duration::from_secs(self.retry.call_timeout_secs);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(OrchError::Cancelled);
            }

            let outcome = tokio::select! {
                result = tokio::time::timeout(
                    call_timeout,
                    self.executor.call(&request.review_type, &request.context, model),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ExecutorError::new(
                        ReviewErrorType::Timeout,
                        format!("no response within {}s", call_timeout.as_secs()),
                    )),
                },
                _ = cancel.cancelled() => return Err(OrchError::Cancelled),
            };

            match outcome {
                Ok(response) => return Ok(Ok(response)),
                Err(err) => {
                    let cap = err.error_type.attempt_cap(self.retry.max_attempts);
                    log_debug!(
                        "[review:{}] '{}' attempt {}/{} failed: {} ({})",
                        request.review_type,
                        model,
                        attempt,
                        cap,
                        err.error_type,
                        err.message
                    );
                    if attempt >= cap {
                        return Ok(Err(err));
                    }
                }
            }

            let delay = self.backoff_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(OrchError::Cancelled),
            }
        }
    }

    /// base * factor^(attempt-1), with ±jitter applied.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.base_delay_ms as f64;
        let factor = (self.retry.factor as f64).powi(attempt.saturating_sub(1) as i32);
        let jitter = if self.retry.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.retry.jitter..=1.0 + self.retry.jitter)
        } else {
            1.0
        };
        Duration::from_millis((base * factor * jitter).max(0.0) as u64)
    }
}

// --- Quorum ---

#[derive(Debug, Clone, PartialEq)]
pub struct QuorumOutcome {
    pub satisfied: usize,
    pub required: usize,
    pub met: bool,
    pub on_insufficient: OnInsufficient,
}

/// Evaluate the quorum condition: at least `minimum_required` of the
/// configured review types succeeded.
pub fn evaluate_quorum(settings: &ReviewSettings, succeeded: &HashSet<String>) -> QuorumOutcome {
    let satisfied = settings
        .required_reviews
        .iter()
        .filter(|t| succeeded.contains(t.as_str()))
        .count();
    QuorumOutcome {
        satisfied,
        required: settings.minimum_required,
        met: satisfied >= settings.minimum_required,
        on_insufficient: settings.on_insufficient,
    }
}

// --- HTTP executor ---

/// Production executor posting review requests to configured provider
/// endpoints. The provider's response shape is
/// `{verdict: "pass"|"fail", findings: [{severity, message, blocking}], usage}`.
pub struct HttpReviewExecutor {
    client: reqwest::Client,
    providers: std::collections::HashMap<String, ProviderConfig>,
}

impl HttpReviewExecutor {
    pub fn new(
        providers: std::collections::HashMap<String, ProviderConfig>,
        call_timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, providers })
    }
}

#[derive(Deserialize)]
struct ProviderResponse {
    verdict: String,
    #[serde(default)]
    findings: Vec<ReviewFinding>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

impl ReviewExecutor for HttpReviewExecutor {
    async fn call(
        &self,
        review_type: &str,
        context: &ReviewContext,
        model: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let provider = self.providers.get(model).ok_or_else(|| {
            ExecutorError::new(
                ReviewErrorType::KeyMissing,
                format!("no provider configured for model '{}'", model),
            )
        })?;

        let endpoint = provider.endpoint.as_deref().ok_or_else(|| {
            ExecutorError::new(
                ReviewErrorType::KeyMissing,
                format!("provider '{}' has no endpoint", model),
            )
        })?;

        let api_key = match provider.api_key_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.is_empty() => Some(key),
                _ => {
                    return Err(ExecutorError::new(
                        ReviewErrorType::KeyMissing,
                        format!("{} is not set", var),
                    ))
                }
            },
            None => None,
        };

        let body = serde_json::json!({
            "model": provider.model.as_deref().unwrap_or(model),
            "review_type": review_type,
            "context": context,
        });

        let mut request = self.client.post(endpoint).json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::new(ReviewErrorType::Timeout, e.to_string())
            } else {
                ExecutorError::new(ReviewErrorType::NetworkError, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            ExecutorError::new(ReviewErrorType::NetworkError, e.to_string())
        })?;

        if !(200..300).contains(&status) {
            return Err(ExecutorError::new(
                classify_status(status, &text),
                format!("HTTP {}: {}", status, truncate(&text, 256)),
            ));
        }

        let parsed: ProviderResponse = serde_json::from_str(&text).map_err(|e| {
            ExecutorError::new(
                ReviewErrorType::ParseError,
                format!("unparseable review response: {}", e),
            )
        })?;

        if parsed.verdict != "pass" {
            return Err(ExecutorError::new(
                ReviewErrorType::ReviewFailed,
                summarize_findings(&parsed.findings),
            ));
        }

        Ok(ExecutorResponse {
            raw_output: text,
            findings: parsed.findings,
            usage: parsed.usage,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn summarize_findings(findings: &[ReviewFinding]) -> String {
    let blocking: Vec<&str> = findings
        .iter()
        .filter(|f| f.blocking)
        .map(|f| f.message.as_str())
        .collect();
    if blocking.is_empty() {
        "review returned a failing verdict".to_string()
    } else {
        format!("blocking findings: {}", blocking.join("; "))
    }
}

// --- Mock executor ---

/// Mock executor for router tests. Returns predefined outcomes in
/// sequence and records each `(model, review_type)` call.
pub struct MockReviewExecutor {
    results: tokio::sync::Mutex<Vec<Result<ExecutorResponse, ExecutorError>>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockReviewExecutor {
    pub fn new(results: Vec<Result<ExecutorResponse, ExecutorError>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ReviewExecutor for MockReviewExecutor {
    async fn call(
        &self,
        review_type: &str,
        _context: &ReviewContext,
        model: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{}:{}", model, review_type));
        }
        let mut results = self.results.lock().await;
        results.pop().unwrap_or_else(|| {
            Err(ExecutorError::new(
                ReviewErrorType::NetworkError,
                "MockReviewExecutor: no more results in sequence",
            ))
        })
    }
}
