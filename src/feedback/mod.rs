//! Reviewer feedback classification
//!
//! Free-text feedback becomes a tagged [`ClassificationResult`]. Judgment is
//! delegated to a language model when one is configured; its JSON answer is
//! validated here and anything unusable falls back to a major revision.

use crate::config::FeedbackConfig;
use crate::llm::{call_with_retry, LanguageModel, ModelError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// What the pipeline should do with the reviewed artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Approved,
    Revision,
    Recollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub action: FeedbackAction,
    pub severity: Option<Severity>,
    /// Search terms the reviewer asked for; used on recollection
    #[serde(default)]
    pub extracted_keywords: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl ClassificationResult {
    pub fn approved() -> Self {
        Self {
            action: FeedbackAction::Approved,
            severity: None,
            extracted_keywords: Vec::new(),
            reasoning: None,
        }
    }

    pub fn revision(severity: Severity) -> Self {
        Self {
            action: FeedbackAction::Revision,
            severity: Some(severity),
            extracted_keywords: Vec::new(),
            reasoning: None,
        }
    }

    pub fn recollection(keywords: Vec<String>) -> Self {
        Self {
            action: FeedbackAction::Recollection,
            severity: Some(Severity::Major),
            extracted_keywords: keywords,
            reasoning: None,
        }
    }

    /// Result used when the model fails or answers nonsense
    pub fn fallback() -> Self {
        Self::revision(Severity::Major)
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.action == FeedbackAction::Approved
    }
}

/// The JSON shape a model may answer with. Both the `action` and the
/// `severity`/`suggested_action` vocabularies are accepted.
#[derive(Debug, Deserialize)]
struct ModelAnswer {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    suggested_action: Option<String>,
    #[serde(default, alias = "extracted_keywords")]
    keywords: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse a model answer into a classification.
///
/// The answer may wrap its JSON object in prose or code fences.
pub fn parse_model_answer(answer: &str) -> Result<ClassificationResult, ModelError> {
    let start = answer
        .find('{')
        .ok_or_else(|| ModelError::InvalidResponse("no JSON object".to_string()))?;
    let end = answer
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| ModelError::InvalidResponse("unterminated JSON object".to_string()))?;

    let parsed: ModelAnswer = serde_json::from_str(&answer[start..=end])
        .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

    let severity = match parsed.severity.as_deref().map(str::to_lowercase).as_deref() {
        Some("minor") => Some(Severity::Minor),
        Some("major") => Some(Severity::Major),
        Some("accept") | None => None,
        Some(other) => {
            return Err(ModelError::InvalidResponse(format!(
                "unknown severity '{}'",
                other
            )))
        }
    };
    let accepted_by_severity = parsed
        .severity
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("accept"));

    let action = match parsed.action.as_deref().map(str::to_lowercase).as_deref() {
        Some("approved" | "approve" | "accept") => FeedbackAction::Approved,
        Some("revision" | "revise") => FeedbackAction::Revision,
        Some("recollection" | "recollect") => FeedbackAction::Recollection,
        Some(other) => {
            return Err(ModelError::InvalidResponse(format!(
                "unknown action '{}'",
                other
            )))
        }
        None => match (accepted_by_severity, severity, parsed.suggested_action.as_deref()) {
            (true, _, _) => FeedbackAction::Approved,
            (_, Some(Severity::Minor), _) => FeedbackAction::Revision,
            (_, Some(Severity::Major), Some("revise_report")) => FeedbackAction::Revision,
            (_, Some(Severity::Major), _) => FeedbackAction::Recollection,
            (_, None, _) => {
                return Err(ModelError::InvalidResponse(
                    "answer has neither action nor severity".to_string(),
                ))
            }
        },
    };

    let result = match action {
        FeedbackAction::Approved => ClassificationResult::approved(),
        FeedbackAction::Revision => {
            ClassificationResult::revision(severity.unwrap_or(Severity::Major))
        }
        FeedbackAction::Recollection => ClassificationResult::recollection(clean_keywords(
            parsed.keywords,
        )),
    };

    Ok(match parsed.reasoning {
        Some(reasoning) => result.with_reasoning(reasoning),
        None => result,
    })
}

fn clean_keywords(keywords: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in keywords {
        let keyword = keyword.trim().to_string();
        if !keyword.is_empty() && !out.contains(&keyword) {
            out.push(keyword);
        }
    }
    out
}

pub(crate) fn quoted_phrases(text: &str) -> Vec<String> {
    static QUOTED: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = QUOTED.get_or_init(|| Regex::new(r#"["“]([^"”]+)["”]"#).ok()) else {
        return Vec::new();
    };
    clean_keywords(
        re.captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
    )
}

fn build_prompt(feedback: &str) -> String {
    format!(
        "Classify the reviewer feedback on a technology trend report.\n\
         Answer with JSON only: {{\"action\": \"approved\" | \"revision\" | \"recollection\", \
         \"severity\": \"minor\" | \"major\", \"keywords\": [..], \"reasoning\": \"..\"}}.\n\
         Use \"recollection\" only when the data itself is missing or off-topic; \
         list the topics to search for in \"keywords\". When unsure, prefer \"revision\".\n\n\
         Feedback:\n{}",
        feedback
    )
}

/// Feedback classifier
pub struct FeedbackClassifier {
    model: Option<Arc<dyn LanguageModel>>,
    config: FeedbackConfig,
    max_attempts: u32,
}

impl FeedbackClassifier {
    pub fn new(
        model: Option<Arc<dyn LanguageModel>>,
        config: FeedbackConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            model,
            config,
            max_attempts,
        }
    }

    /// Classify feedback. Never fails: unusable model output becomes a major
    /// revision.
    pub async fn classify(&self, feedback: &str) -> ClassificationResult {
        if self.is_explicit_approval(feedback) {
            debug!("Feedback is an explicit approval");
            return ClassificationResult::approved();
        }

        let Some(model) = &self.model else {
            return self.classify_with_rules(feedback);
        };

        let answer = match call_with_retry(model.as_ref(), &build_prompt(feedback), self.max_attempts).await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Feedback classification failed, assuming major revision: {}", e);
                return ClassificationResult::fallback();
            }
        };

        match parse_model_answer(&answer) {
            Ok(result) => result,
            Err(e) => {
                warn!("Unusable classification answer, assuming major revision: {}", e);
                ClassificationResult::fallback()
            }
        }
    }

    /// Empty feedback or a lone approval keyword
    pub fn is_explicit_approval(&self, feedback: &str) -> bool {
        let normalized = feedback
            .trim()
            .trim_end_matches(['.', '!', '?'])
            .trim()
            .to_lowercase();
        normalized.is_empty()
            || self
                .config
                .approval_keywords
                .iter()
                .any(|k| k.to_lowercase() == normalized)
    }

    /// Keyword rules used when no model is configured.
    ///
    /// Recollection cues ask for new data; anything else is a minor revision.
    pub fn classify_with_rules(&self, feedback: &str) -> ClassificationResult {
        let lowered = feedback.to_lowercase();
        let cue = self
            .config
            .recollection_cues
            .iter()
            .find(|cue| lowered.contains(&cue.to_lowercase()));

        match cue {
            Some(cue) => ClassificationResult::recollection(quoted_phrases(feedback))
                .with_reasoning(format!("feedback mentions '{}'", cue)),
            None => ClassificationResult::revision(Severity::Minor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(Result<String, ModelError>);

    #[async_trait]
    impl LanguageModel for Canned {
        async fn call(&self, _prompt: &str) -> Result<String, ModelError> {
            self.0.clone()
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn with_model(answer: Result<&str, ModelError>) -> FeedbackClassifier {
        let model = Canned(answer.map(str::to_string));
        FeedbackClassifier::new(Some(Arc::new(model)), FeedbackConfig::default(), 2)
    }

    #[test]
    fn test_parse_action_vocabulary() {
        let result =
            parse_model_answer(r#"{"action": "recollection", "keywords": ["solid-state battery", " "]}"#)
                .unwrap();
        assert_eq!(result.action, FeedbackAction::Recollection);
        assert_eq!(result.extracted_keywords, vec!["solid-state battery"]);

        let result = parse_model_answer(r#"{"action": "revision", "severity": "minor"}"#).unwrap();
        assert_eq!(result, ClassificationResult::revision(Severity::Minor));
    }

    #[test]
    fn test_parse_severity_vocabulary() {
        let accept = parse_model_answer(r#"{"severity": "accept"}"#).unwrap();
        assert!(accept.is_approved());

        let restart = parse_model_answer(
            r#"{"severity": "major", "suggested_action": "restart_collection", "reasoning": "no data"}"#,
        )
        .unwrap();
        assert_eq!(restart.action, FeedbackAction::Recollection);
        assert_eq!(restart.reasoning.as_deref(), Some("no data"));

        let rewrite =
            parse_model_answer(r#"{"severity": "major", "suggested_action": "revise_report"}"#)
                .unwrap();
        assert_eq!(rewrite, ClassificationResult::revision(Severity::Major));
    }

    #[test]
    fn test_parse_wrapped_json() {
        let answer = "Sure!\n```json\n{\"action\": \"approved\"}\n```";
        assert!(parse_model_answer(answer).unwrap().is_approved());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_model_answer("no json here").is_err());
        assert!(parse_model_answer(r#"{"action": "explode"}"#).is_err());
        assert!(parse_model_answer(r#"{"reasoning": "hmm"}"#).is_err());
    }

    #[tokio::test]
    async fn test_approval_shortcut_skips_model() {
        let classifier = with_model(Err(ModelError::Unavailable("down".to_string())));
        assert!(classifier.classify("  LGTM! ").await.is_approved());
        assert!(classifier.classify("").await.is_approved());
    }

    #[tokio::test]
    async fn test_model_failure_is_major_revision() {
        let classifier = with_model(Err(ModelError::Timeout(5)));
        assert_eq!(
            classifier.classify("rewrite section 2").await,
            ClassificationResult::fallback()
        );

        let classifier = with_model(Ok("I think it is fine"));
        assert_eq!(
            classifier.classify("rewrite section 2").await,
            ClassificationResult::fallback()
        );
    }

    #[tokio::test]
    async fn test_model_answer_used() {
        let classifier = with_model(Ok(r#"{"action": "revision", "severity": "minor"}"#));
        assert_eq!(
            classifier.classify("tone it down").await,
            ClassificationResult::revision(Severity::Minor)
        );
    }

    #[tokio::test]
    async fn test_rules_without_model() {
        let classifier = FeedbackClassifier::new(None, FeedbackConfig::default(), 2);

        let result = classifier
            .classify("Not enough data, look into \"solid-state batteries\"")
            .await;
        assert_eq!(result.action, FeedbackAction::Recollection);
        assert_eq!(result.extracted_keywords, vec!["solid-state batteries"]);

        let result = classifier.classify("section 3 needs more detail").await;
        assert_eq!(result, ClassificationResult::revision(Severity::Minor));
    }
}
