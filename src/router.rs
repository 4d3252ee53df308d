//! Intent router
//!
//! Ordered decision policy dispatching each allowed turn to exactly one
//! stage. Early rules are deterministic; only the final rule consults
//! the LLM.

use crate::llm::{parse_structured, ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::{RouteTarget, SafetyCategory, SafetyResult};
use crate::profile::is_complete;
use crate::state::Session;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

const ROUTER_PROMPT: &str = r#"You are an intelligent Router for a Financial AI System.
Analyze the conversation context and the user's latest input to select the next step.

**Context Analysis:**
- Previous AI Action: Did the AI suggest additional research? Did the AI ask for a preference?

**Routing Logic (Strict Rules):**

1. **`report_generation`**
   - Trigger: When the user wants to **FINALIZE** and see the result.
   - Scenarios:
     - User says "Write the report", "Summarize now", "Give me the conclusion".
     - User **REJECTS** further debate/research and asks for the result.
     - User agrees to the AI's suggestion to write a report.

2. **`investment_advisory`**
   - Trigger: When the user wants **MORE** discussion, analysis, or comparison.
   - Scenarios:
     - User asks a deep question: "Compare Nvidia vs Tesla", "What about risks?".
     - User agrees to the AI's suggestion for *additional research*.
     - User answers a preference question to refine the strategy.

3. **`market_data`**
   - Trigger: Simple factual queries.
   - Scenarios: "Price of Apple", "What is ETF", "Find low-fee funds".

4. **`profile_management`**
   - Trigger: Explicit profile changes.
   - Scenarios: "Change my income", "Update my risk level".

**Response Format:**
Output ONLY valid JSON: {"route": "route_name", "reason": "brief reasoning"}"#;

/// Explicit edit phrases that reopen collection on a complete profile.
const CHANGE_KEYWORDS: &[&str] = &["change", "update", "modify", "edit", "correct", "re-enter"];

#[derive(Debug, Deserialize)]
struct RouteDecision {
    route: Option<String>,
    reason: Option<String>,
}

/// Intent Router stage
pub struct IntentRouter {
    backend: Arc<dyn CompletionBackend>,
}

impl IntentRouter {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// Pick the next stage for the current turn. May save the turn's text
    /// as the deferred query when onboarding interrupts a substantive
    /// question.
    pub async fn decide(&self, session: &mut Session) -> RouteTarget {
        let safety = session
            .safety_result
            .clone()
            .unwrap_or_else(|| SafetyResult::fail_open("unclassified turn"));

        // The graph's entry edge already enforces this; a blocked turn
        // must still never be re-routed.
        if !safety.allowed {
            return RouteTarget::Terminate;
        }

        let user_input = session.last_user_text().unwrap_or_default().to_string();

        if !is_complete(&session.profile) {
            if safety.category == SafetyCategory::Finance
                && session.deferred_query.is_none()
                && !user_input.is_empty()
            {
                info!("Deferring substantive query until onboarding completes");
                session.deferred_query = Some(user_input.clone());
            }
            info!("Profile incomplete, routing to profile collector");
            return RouteTarget::ProfileCollector;
        }

        if safety.category == SafetyCategory::ProfileUpdate {
            let lowered = user_input.to_lowercase();
            if CHANGE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                return RouteTarget::ProfileCollector;
            }
        }

        if safety.category == SafetyCategory::GeneralChat {
            return RouteTarget::Retrieval;
        }

        let context = session
            .previous_assistant_text()
            .map(|text| format!("AI's Last Question: {}\n", text))
            .unwrap_or_default();

        let target = self.decide_route(&user_input, &context).await;
        info!(target = ?target, "Routing decision");
        target
    }

    async fn decide_route(&self, query: &str, context: &str) -> RouteTarget {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(format!("{}\n\n--- Context ---\n{}", ROUTER_PROMPT, context)),
            ChatMessage::user(format!("User Input: {}", query)),
        ]);

        let decision: RouteDecision = match self.backend.complete(request).await {
            Ok(response) => match parse_structured(&response.text_content()) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("Route decision unparseable, falling back to retrieval: {}", e);
                    return RouteTarget::Retrieval;
                }
            },
            Err(e) => {
                warn!("Routing call failed, falling back to retrieval: {}", e);
                return RouteTarget::Retrieval;
            }
        };

        if let Some(reason) = &decision.reason {
            info!(reason = %reason, "Router rationale");
        }

        match decision.route.as_deref() {
            Some("market_data") => RouteTarget::Retrieval,
            Some("investment_advisory") => RouteTarget::Debate,
            Some("report_generation") => RouteTarget::Report,
            Some("profile_management") => RouteTarget::ProfileCollector,
            other => {
                warn!(label = ?other, "Unknown route label, falling back to retrieval");
                RouteTarget::Retrieval
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedBackend};
    use serde_json::json;

    fn full_profile_session() -> Session {
        let mut session = Session::new("s1", "user_ext_001");
        for field in crate::profile::REQUIRED_FIELDS {
            session
                .profile
                .insert(field.to_string(), json!("populated"));
        }
        session
    }

    fn allowed(category: SafetyCategory) -> SafetyResult {
        SafetyResult {
            allowed: true,
            category,
            reason: String::new(),
        }
    }

    fn router_with(responses: Vec<CompletionResponse>) -> (IntentRouter, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(responses));
        (IntentRouter::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_blocked_turn_terminates_without_routing() {
        let (router, backend) = router_with(vec![]);
        let mut session = full_profile_session();
        session.push_user("blocked input");
        session.safety_result = Some(SafetyResult {
            allowed: false,
            category: SafetyCategory::Unsafe,
            reason: "blocked".to_string(),
        });

        assert_eq!(router.decide(&mut session).await, RouteTarget::Terminate);
        assert!(backend.seen_requests().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_profile_routes_to_collector_and_defers_query() {
        let (router, _) = router_with(vec![]);
        let mut session = Session::new("s1", "u1");
        session.push_user("Compare Nvidia vs Tesla");
        session.safety_result = Some(allowed(SafetyCategory::Finance));

        assert_eq!(
            router.decide(&mut session).await,
            RouteTarget::ProfileCollector
        );
        assert_eq!(
            session.deferred_query.as_deref(),
            Some("Compare Nvidia vs Tesla")
        );

        // A later finance turn must not displace the first deferral.
        session.push_user("What about AMD?");
        router.decide(&mut session).await;
        assert_eq!(
            session.deferred_query.as_deref(),
            Some("Compare Nvidia vs Tesla")
        );
    }

    #[tokio::test]
    async fn test_greetings_are_not_deferred() {
        let (router, _) = router_with(vec![]);
        let mut session = Session::new("s1", "u1");
        session.push_user("Hello there!");
        session.safety_result = Some(allowed(SafetyCategory::GeneralChat));

        assert_eq!(
            router.decide(&mut session).await,
            RouteTarget::ProfileCollector
        );
        assert!(session.deferred_query.is_none());
    }

    #[tokio::test]
    async fn test_explicit_change_reopens_complete_profile() {
        let (router, backend) = router_with(vec![]);
        let mut session = full_profile_session();
        session.push_user("Change my income to 80M");
        session.safety_result = Some(allowed(SafetyCategory::ProfileUpdate));

        assert_eq!(
            router.decide(&mut session).await,
            RouteTarget::ProfileCollector
        );
        assert!(backend.seen_requests().is_empty());
    }

    #[tokio::test]
    async fn test_general_chat_falls_back_to_retrieval() {
        let (router, _) = router_with(vec![]);
        let mut session = full_profile_session();
        session.push_user("Thanks!");
        session.safety_result = Some(allowed(SafetyCategory::GeneralChat));

        assert_eq!(router.decide(&mut session).await, RouteTarget::Retrieval);
    }

    #[tokio::test]
    async fn test_llm_labels_map_to_stages() {
        let cases = [
            ("market_data", RouteTarget::Retrieval),
            ("investment_advisory", RouteTarget::Debate),
            ("report_generation", RouteTarget::Report),
            ("profile_management", RouteTarget::ProfileCollector),
        ];

        for (label, expected) in cases {
            let (router, _) = router_with(vec![CompletionResponse::text(format!(
                r#"{{"route": "{}", "reason": "test"}}"#,
                label
            ))]);
            let mut session = full_profile_session();
            session.push_user("Compare Nvidia vs Tesla");
            session.safety_result = Some(allowed(SafetyCategory::Finance));

            assert_eq!(router.decide(&mut session).await, expected, "{}", label);
        }
    }

    #[tokio::test]
    async fn test_unparseable_route_defaults_to_retrieval() {
        let (router, _) = router_with(vec![CompletionResponse::text("beats me")]);
        let mut session = full_profile_session();
        session.push_user("Price of Apple");
        session.safety_result = Some(allowed(SafetyCategory::Finance));

        assert_eq!(router.decide(&mut session).await, RouteTarget::Retrieval);
    }

    #[tokio::test]
    async fn test_router_sees_prior_assistant_turn() {
        let (router, backend) = router_with(vec![CompletionResponse::text(
            r#"{"route": "investment_advisory", "reason": "user agreed"}"#,
        )]);
        let mut session = full_profile_session();
        session.push_user("Tell me about Nvidia");
        session.push_assistant("Shall I run a deeper risk comparison?");
        session.push_user("Yes, go ahead");
        session.safety_result = Some(allowed(SafetyCategory::Finance));

        assert_eq!(router.decide(&mut session).await, RouteTarget::Debate);

        let requests = backend.seen_requests();
        assert!(requests[0].messages[0]
            .content
            .contains("Shall I run a deeper risk comparison?"));
    }
}
