use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Consecutive failures before requests are short-circuited
    pub circuit_threshold: u32,
    pub circuit_reset: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            circuit_threshold: 5,
            circuit_reset: Duration::from_secs(60),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited by {provider}: {message}")]
    RateLimited {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error with {provider} (retryable: {retryable}): {error}")]
    NetworkError {
        provider: String,
        error: String,
        retryable: bool,
    },

    #[error("API error from {provider}: {message}")]
    ApiError { provider: String, message: String },

    #[error("Parse error from {provider}: {message}")]
    ParseError { provider: String, message: String },

    #[error("Authentication error with {provider}: {message}")]
    AuthenticationError { provider: String, message: String },

    #[error("Invalid request to {provider}: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("Service unavailable for {provider}")]
    ServiceUnavailable {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Circuit breaker open for {provider}. Reset in: {reset_time:?}")]
    CircuitBreakerOpen { provider: String, reset_time: Duration },

    #[error("Max retries ({attempts}) exceeded for {provider}: {last_error}")]
    MaxRetriesExceeded {
        provider: String,
        attempts: u32,
        last_error: String,
    },
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::NetworkError { retryable, .. } => *retryable,
            LlmError::ServiceUnavailable { .. } => true,
            LlmError::ApiError { .. }
            | LlmError::ParseError { .. }
            | LlmError::AuthenticationError { .. }
            | LlmError::InvalidRequest { .. }
            | LlmError::CircuitBreakerOpen { .. }
            | LlmError::MaxRetriesExceeded { .. } => false,
        }
    }

    /// Server-suggested wait before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. }
            | LlmError::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreakerState {
    fn remaining(&self) -> Option<Duration> {
        self.open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

/// Retries transient LLM failures with exponential backoff and trips a circuit
/// breaker after repeated failures
pub struct ErrorHandler {
    provider: String,
    config: RetryConfig,
    circuit: CircuitBreakerState,
}

impl ErrorHandler {
    pub fn new(provider: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            circuit: CircuitBreakerState::default(),
        }
    }

    /// Execute a function with retry logic and error handling
    pub async fn execute_with_retry<F, Fut, T>(&mut self, mut operation: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        if let Some(reset_time) = self.circuit.remaining() {
            return Err(LlmError::CircuitBreakerOpen {
                provider: self.provider.clone(),
                reset_time,
            });
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => {
                    self.circuit = CircuitBreakerState::default();
                    return Ok(result);
                }
                Err(error) => {
                    self.record_failure();

                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if attempts > self.config.max_retries {
                        return Err(LlmError::MaxRetriesExceeded {
                            provider: self.provider.clone(),
                            attempts,
                            last_error: error.to_string(),
                        });
                    }

                    let delay = error
                        .retry_after()
                        .map(|d| d.min(self.config.max_delay))
                        .unwrap_or_else(|| self.calculate_delay(attempts));
                    warn!(provider = %self.provider, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %error, "Retrying LLM request");
                    sleep(delay).await;
                }
            }
        }
    }

    fn record_failure(&mut self) {
        self.circuit.consecutive_failures += 1;
        if self.circuit.consecutive_failures >= self.config.circuit_threshold {
            debug!(provider = %self.provider, failures = self.circuit.consecutive_failures, "Opening circuit breaker");
            self.circuit.open_until = Some(Instant::now() + self.config.circuit_reset);
        }
    }

    #[cfg(test)]
    pub fn is_circuit_open(&self) -> bool {
        self.circuit.remaining().is_some()
    }

    /// Calculate delay for retry with exponential backoff
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.base_delay.as_millis() as f64;
        let delay_ms = base_delay_ms * self.config.backoff_multiplier.powi(attempt as i32 - 1);

        let final_delay_ms = if self.config.jitter {
            // ±25% randomization
            let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        let delay = Duration::from_millis(final_delay_ms as u64);
        std::cmp::min(delay, self.config.max_delay)
    }
}
