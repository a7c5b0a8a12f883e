//! Language model seam
//!
//! Text generation is an external collaborator. Callers own the retry
//! policy: a model implementation makes exactly one attempt per call.

mod command;

pub use command::CommandModel;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

/// Prompt in, text out
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn call(&self, prompt: &str) -> Result<String, ModelError>;

    fn name(&self) -> &str;
}

/// Call a model up to `max_attempts` times, returning the first success
pub async fn call_with_retry(
    model: &dyn LanguageModel,
    prompt: &str,
    max_attempts: u32,
) -> Result<String, ModelError> {
    let attempts = max_attempts.max(1);
    let mut last_error = ModelError::Unavailable("no attempt made".to_string());

    for attempt in 1..=attempts {
        match model.call(prompt).await {
            Ok(answer) => return Ok(answer),
            Err(e) => {
                warn!(
                    "Model {} attempt {}/{} failed: {}",
                    model.name(),
                    attempt,
                    attempts,
                    e
                );
                last_error = e;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LanguageModel for Flaky {
        async fn call(&self, _prompt: &str) -> Result<String, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ModelError::Unavailable("busy".to_string()))
            } else {
                Ok("done".to_string())
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let model = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        assert_eq!(call_with_retry(&model, "p", 2).await.unwrap(), "done");
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let model = Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        assert!(call_with_retry(&model, "p", 2).await.is_err());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
