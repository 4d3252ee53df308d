//! Safety & domain classifier
//!
//! Screens every incoming turn before any stage runs. Context-aware: a
//! bare "yes" answering a prior question classifies as on-topic finance,
//! not as chit-chat or a profile update. Fails open on classifier noise;
//! see `SafetyResult::fail_open`.

use crate::llm::{parse_structured, ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::{SafetyCategory, SafetyResult};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

const CLASSIFIER_PROMPT: &str = r#"You are the Security & Domain Guardrail for a Financial AI.
Determine if the user input is safe and relevant.

**Context Awareness Rules:**
1. **Previous AI Question:** If the AI asked a question (e.g., "Do you prefer growth or dividend?"), and the user answers (e.g., "Growth", "Yes", "No"), this is **'finance'**, NOT 'general_chat' or 'profile_update'.
2. **Profile Update:** Classify as 'profile_update' ONLY if the user EXPLICITLY asks to change data (e.g., "Change my income", "Update risk level").
3. **General Chat:** Greetings ("Hi") or simple thanks ("Thank you").
4. **Unsafe:** Hate speech, illegal acts, etc.

**Categories:**
- 'finance': Investment questions, market data, OR **answers to AI's questions**.
- 'profile_update': Explicit commands to change stored info.
- 'general_chat': Irrelevant to finance but safe.
- 'unsafe': Block this.

Output JSON: {"is_allowed": bool, "category": "...", "reason": "..."}"#;

#[derive(Debug, Deserialize)]
struct ClassifierVerdict {
    is_allowed: Option<bool>,
    category: Option<String>,
    reason: Option<String>,
}

fn category_from_label(label: &str) -> SafetyCategory {
    match label {
        "finance" => SafetyCategory::Finance,
        "profile_update" => SafetyCategory::ProfileUpdate,
        "general_chat" => SafetyCategory::GeneralChat,
        "unsafe" => SafetyCategory::Unsafe,
        _ => SafetyCategory::Finance,
    }
}

/// Turn-level safety classifier
pub struct SafetyClassifier {
    backend: Arc<dyn CompletionBackend>,
}

impl SafetyClassifier {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// Classify the latest user text, with the immediately preceding
    /// assistant text as disambiguation context when present.
    pub async fn classify(
        &self,
        user_text: &str,
        previous_assistant: Option<&str>,
    ) -> SafetyResult {
        let mut content = String::new();
        if let Some(prior) = previous_assistant {
            content.push_str(&format!("AI previously asked: \"{}\"\n", prior));
        }
        content.push_str(&format!("User Input: \"{}\"", user_text));

        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(content),
        ]);

        let result = match self.backend.complete(request).await {
            Ok(response) => Self::parse_verdict(&response.text_content()),
            Err(e) => {
                warn!("Classifier call failed, failing open: {}", e);
                SafetyResult::fail_open(format!("Classifier error: {}", e))
            }
        };

        info!(
            category = ?result.category,
            allowed = result.allowed,
            "Turn classified"
        );

        result
    }

    fn parse_verdict(raw: &str) -> SafetyResult {
        let verdict: ClassifierVerdict = match parse_structured(raw) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Classifier verdict unparseable, failing open: {}", e);
                return SafetyResult::fail_open("Unparseable classifier output");
            }
        };

        let Some(allowed) = verdict.is_allowed else {
            return SafetyResult::fail_open("Classifier omitted is_allowed");
        };

        SafetyResult {
            allowed,
            category: verdict
                .category
                .as_deref()
                .map(category_from_label)
                .unwrap_or(SafetyCategory::Finance),
            reason: verdict.reason.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedBackend};

    fn classifier_with(responses: Vec<CompletionResponse>) -> (SafetyClassifier, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(responses));
        (SafetyClassifier::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_blocks_unsafe_input() {
        let (classifier, _) = classifier_with(vec![CompletionResponse::text(
            r#"{"is_allowed": false, "category": "unsafe", "reason": "illegal activity"}"#,
        )]);

        let result = classifier.classify("how do I launder money", None).await;
        assert!(!result.allowed);
        assert_eq!(result.category, SafetyCategory::Unsafe);
    }

    #[tokio::test]
    async fn test_parse_failure_fails_open_to_finance() {
        let (classifier, _) = classifier_with(vec![CompletionResponse::text(
            "I think this is probably fine?",
        )]);

        let result = classifier.classify("Price of Apple", None).await;
        assert!(result.allowed);
        assert_eq!(result.category, SafetyCategory::Finance);
    }

    #[tokio::test]
    async fn test_missing_allowed_key_fails_open() {
        let (classifier, _) = classifier_with(vec![CompletionResponse::text(
            r#"{"category": "unsafe", "reason": "suspicious"}"#,
        )]);

        let result = classifier.classify("hmm", None).await;
        assert!(result.allowed);
        assert_eq!(result.category, SafetyCategory::Finance);
    }

    #[tokio::test]
    async fn test_backend_error_fails_open() {
        // Empty script: the first call errors out.
        let (classifier, _) = classifier_with(vec![]);

        let result = classifier.classify("Price of Apple", None).await;
        assert!(result.allowed);
        assert_eq!(result.category, SafetyCategory::Finance);
    }

    #[tokio::test]
    async fn test_previous_assistant_text_reaches_the_model() {
        let (classifier, backend) = classifier_with(vec![CompletionResponse::text(
            r#"{"is_allowed": true, "category": "finance", "reason": "answer to question"}"#,
        )]);

        classifier
            .classify("Yes", Some("Do you prefer growth or dividend?"))
            .await;

        let requests = backend.seen_requests();
        let user_msg = &requests[0].messages[1];
        assert!(user_msg.content.contains("growth or dividend"));
        assert!(user_msg.content.contains("User Input: \"Yes\""));
    }
}
