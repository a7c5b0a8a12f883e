//! Model-backed tool selection

use super::state::PipelineState;
use super::tools::{Phase, Tool, ToolSelector};
use crate::llm::{call_with_retry, LanguageModel, ModelError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Asks a language model which of a phase's eligible tools to run.
///
/// A failed call or an unusable answer picks nothing, which leaves every
/// eligible tool in play.
pub struct ModelToolSelector {
    model: Arc<dyn LanguageModel>,
    max_attempts: u32,
}

impl ModelToolSelector {
    pub fn new(model: Arc<dyn LanguageModel>, max_attempts: u32) -> Self {
        Self {
            model,
            max_attempts,
        }
    }
}

#[async_trait]
impl ToolSelector for ModelToolSelector {
    async fn select(&self, phase: Phase, eligible: &[Tool], state: &PipelineState) -> Vec<Tool> {
        if eligible.len() <= 1 {
            return eligible.to_vec();
        }

        let prompt = build_prompt(phase, eligible, state);
        let answer = match call_with_retry(self.model.as_ref(), &prompt, self.max_attempts).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Tool selection by {} failed: {}", self.model.name(), e);
                return Vec::new();
            }
        };

        match parse_tool_choice(&answer, eligible) {
            Ok(tools) => {
                debug!("Model picked {:?} for {:?}", tools, phase);
                tools
            }
            Err(e) => {
                warn!("Ignoring tool choice from {}: {}", self.model.name(), e);
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolChoice {
    tools: Vec<String>,
}

/// Parse a `{"tools": [...]}` answer against the eligible set.
///
/// The object may be wrapped in prose or code fences. A name that is not
/// eligible rejects the whole answer, as does an empty list.
pub fn parse_tool_choice(answer: &str, eligible: &[Tool]) -> Result<Vec<Tool>, ModelError> {
    let start = answer
        .find('{')
        .ok_or_else(|| ModelError::InvalidResponse("no JSON object".to_string()))?;
    let end = answer
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ModelError::InvalidResponse("unterminated JSON object".to_string()))?;

    let parsed: ToolChoice = serde_json::from_str(&answer[start..=end])
        .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

    let mut tools = Vec::with_capacity(parsed.tools.len());
    for name in parsed.tools {
        let name = name.trim().to_lowercase();
        let tool = eligible
            .iter()
            .copied()
            .find(|tool| tool.to_string() == name)
            .ok_or_else(|| {
                ModelError::InvalidResponse(format!("tool '{}' is not eligible", name))
            })?;
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }

    if tools.is_empty() {
        return Err(ModelError::InvalidResponse("no tools chosen".to_string()));
    }
    Ok(tools)
}

fn build_prompt(phase: Phase, eligible: &[Tool], state: &PipelineState) -> String {
    let tools: Vec<String> = eligible.iter().map(Tool::to_string).collect();
    let gaps = state
        .last_assessment
        .as_ref()
        .map(|a| a.reasons.join("; "))
        .filter(|reasons| !reasons.is_empty())
        .unwrap_or_else(|| "none recorded".to_string());

    format!(
        "Topic: {}\nPhase: {:?}\nKeywords: {}\nCollection attempts so far: {}\nGaps: {}\n\n\
         Pick the tools worth running next from: {}.\n\
         Answer with JSON only: {{\"tools\": [..]}}.",
        state.topic,
        phase,
        state.keywords.join(", "),
        state.evidence.attempt_count,
        gaps,
        tools.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Canned {
        answer: Result<String, ModelError>,
        calls: AtomicU32,
    }

    impl Canned {
        fn new(answer: Result<&str, ModelError>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Canned {
        async fn call(&self, _prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    const COLLECTION: &[Tool] = &[Tool::SearchPapers, Tool::SearchReferences, Tool::SearchNews];

    #[test]
    fn test_parse_fenced_answer() {
        let answer = "Sure:\n```json\n{\"tools\": [\"search_news\", \"Search_Papers\", \"search_news\"]}\n```";
        assert_eq!(
            parse_tool_choice(answer, COLLECTION).unwrap(),
            vec![Tool::SearchNews, Tool::SearchPapers]
        );
    }

    #[test]
    fn test_parse_rejects_bad_answers() {
        for answer in [
            "search_papers please",
            "{\"tools\": []}",
            "{\"tools\": [\"expand_keywords\"]}",
            "{\"tools\": [\"search_patents\"]}",
            "{\"picks\": [\"search_news\"]}",
        ] {
            assert!(
                matches!(
                    parse_tool_choice(answer, COLLECTION),
                    Err(ModelError::InvalidResponse(_))
                ),
                "accepted {}",
                answer
            );
        }
    }

    #[tokio::test]
    async fn test_model_choice_is_used() {
        let model = Canned::new(Ok("{\"tools\": [\"search_references\"]}"));
        let selector = ModelToolSelector::new(model.clone(), 2);
        let state = PipelineState::new("robotics");

        let tools = selector.select(Phase::Collection, COLLECTION, &state).await;
        assert_eq!(tools, vec![Tool::SearchReferences]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_pick_nothing() {
        let state = PipelineState::new("robotics");

        let down = Canned::new(Err(ModelError::Unavailable("offline".to_string())));
        let selector = ModelToolSelector::new(down.clone(), 2);
        assert!(selector.select(Phase::Collection, COLLECTION, &state).await.is_empty());
        assert_eq!(down.calls.load(Ordering::SeqCst), 2);

        let rambling = Canned::new(Ok("I would search everything."));
        let selector = ModelToolSelector::new(rambling, 1);
        assert!(selector.select(Phase::Collection, COLLECTION, &state).await.is_empty());
    }

    #[tokio::test]
    async fn test_single_eligible_tool_skips_model() {
        let model = Canned::new(Ok("{\"tools\": [\"search_news\"]}"));
        let selector = ModelToolSelector::new(model.clone(), 1);
        let state = PipelineState::new("robotics");

        let tools = selector
            .select(Phase::Expansion, Phase::Expansion.eligible(), &state)
            .await;
        assert_eq!(tools, vec![Tool::ExpandKeywords]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
