//! Retry policy shared by all provider clients.
//!
//! Transient failures (rate limiting, connection errors, timeouts) back off
//! exponentially: `base_delay * 2^(attempt-1)`. A request rejected for its
//! token-limit parameter name is resent once with the other name without
//! consuming an attempt. Everything else propagates immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::Error;
use crate::Result;

/// Name of the request field that caps completion length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenParam {
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenParam {
    pub fn key(self) -> &'static str {
        match self {
            TokenParam::MaxTokens => "max_tokens",
            TokenParam::MaxCompletionTokens => "max_completion_tokens",
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            TokenParam::MaxTokens => TokenParam::MaxCompletionTokens,
            TokenParam::MaxCompletionTokens => TokenParam::MaxTokens,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Run `call` under this policy.
    ///
    /// `token_param` is `None` for providers with a single fixed token-limit
    /// field; a [`Error::TokenParameter`] from those propagates unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        provider: &str,
        token_param: Option<TokenParam>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(TokenParam) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_retries.max(1);
        let mut param = token_param.unwrap_or(TokenParam::MaxTokens);
        let mut swapped = false;
        let mut attempt = 1;
        let mut last_error = String::new();

        while attempt <= attempts {
            debug!("{} call attempt {}/{}", provider, attempt, attempts);

            match call(param).await {
                Ok(value) => return Ok(value),
                Err(Error::TokenParameter(msg)) if token_param.is_some() && !swapped => {
                    warn!(
                        "{} rejected '{}'; retrying with '{}': {}",
                        provider,
                        param.key(),
                        param.swapped().key(),
                        msg
                    );
                    param = param.swapped();
                    swapped = true;
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = self.backoff(attempt);
                        warn!(
                            "{} transient error (attempt {}/{}), waiting {:.1}s: {}",
                            provider,
                            attempt,
                            attempts,
                            delay.as_secs_f64(),
                            e
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!("{} transient error on final attempt {}: {}", provider, attempt, e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::RetriesExhausted {
            attempts,
            last_error,
        })
    }
}

/// Map a non-success HTTP status and body onto the error taxonomy.
///
/// `token_param_swappable` marks providers whose 400s about the token-limit
/// field can be fixed by renaming it.
pub fn classify_status(provider: &str, status: u16, body: &str, token_param_swappable: bool) -> Error {
    let detail = format!("{provider} API error {status}: {body}");
    match status {
        429 | 529 => Error::RateLimited(detail),
        408 => Error::Timeout(detail),
        401 | 403 => Error::Auth(detail),
        400 if token_param_swappable && mentions_token_param(body) => Error::TokenParameter(detail),
        500..=599 => Error::Connection(detail),
        _ => Error::Llm(detail),
    }
}

fn mentions_token_param(body: &str) -> bool {
    body.contains(TokenParam::MaxTokens.key()) || body.contains(TokenParam::MaxCompletionTokens.key())
}
