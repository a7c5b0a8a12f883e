//! Terminal review channels

use crate::error::{Result, TrendError};
use crate::pipeline::{Plan, ReviewChannel};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Prints the artifact and reads one line of feedback from stdin.
/// An empty line approves.
pub struct StdinReview {
    input: Mutex<BufReader<tokio::io::Stdin>>,
}

impl StdinReview {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    async fn ask(&self, artifact: &str, prompt: &str) -> Result<String> {
        let mut stdout = tokio::io::stdout();
        let text = format!("\n{}\n\n{} (Enter to approve): ", artifact.trim_end(), prompt);
        stdout
            .write_all(text.as_bytes())
            .await
            .map_err(|e| TrendError::Io {
                source: e,
                context: "Failed to write review prompt".to_string(),
            })?;
        stdout.flush().await.map_err(|e| TrendError::Io {
            source: e,
            context: "Failed to flush review prompt".to_string(),
        })?;

        let mut line = String::new();
        self.input
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(|e| TrendError::Io {
                source: e,
                context: "Failed to read review feedback".to_string(),
            })?;
        Ok(line.trim().to_string())
    }
}

impl Default for StdinReview {
    fn default() -> Self {
        Self::new()
    }
}

fn render_plan(plan: &Plan) -> String {
    let mut text = format!("Plan for '{}'\n", plan.topic);
    for (i, heading) in plan.outline.iter().enumerate() {
        text.push_str(&format!("  {}. {}\n", i + 1, heading));
    }
    text.push_str(&format!("Keywords: {}", plan.keywords.join(", ")));
    text
}

#[async_trait]
impl ReviewChannel for StdinReview {
    async fn review_plan(&self, plan: &Plan) -> Result<String> {
        self.ask(&render_plan(plan), "Plan feedback").await
    }

    async fn review_report(&self, draft: &str) -> Result<String> {
        self.ask(draft, "Report feedback").await
    }
}

/// Approves everything, for unattended runs
pub struct AutoApprove;

#[async_trait]
impl ReviewChannel for AutoApprove {
    async fn review_plan(&self, _plan: &Plan) -> Result<String> {
        Ok(String::new())
    }

    async fn review_report(&self, _draft: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plan() {
        let plan = Plan {
            topic: "edge AI".to_string(),
            outline: vec!["Overview".to_string(), "Outlook".to_string()],
            keywords: vec!["edge AI".to_string(), "npu".to_string()],
        };
        assert_eq!(
            render_plan(&plan),
            "Plan for 'edge AI'\n  1. Overview\n  2. Outlook\nKeywords: edge AI, npu"
        );
    }

    #[tokio::test]
    async fn test_auto_approve_is_empty_feedback() {
        assert!(AutoApprove.review_report("draft").await.unwrap().is_empty());
    }
}
