//! Advisory engine - the per-turn orchestration loop
//!
//! INPUT → CLASSIFY → ROUTE → {PROFILE | RETRIEVE | DEBATE | REPORT} → REPLY

use crate::classifier::SafetyClassifier;
use crate::debate::DebateStage;
use crate::llm::CompletionBackend;
use crate::models::{RouteTarget, StageId, StageOutcome, TurnResult};
use crate::profile::ProfileCollector;
use crate::report::{ComplianceSource, ReportStage};
use crate::retrieval::RetrievalStage;
use crate::router::IntentRouter;
use crate::state::SessionRegistry;
use crate::store::ProfileStore;
use crate::tools::{
    create_debate_registry, create_report_registry, create_retrieval_registry,
    DocumentSearchClient,
};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Cycle guard on router re-entry within one turn. Collector completion
/// resumes the router at most once per deferred query; anything beyond a
/// few resumes is a routing loop.
const MAX_ROUTER_RESUMES: u32 = 4;

const RESUME_CAP_REPLY: &str =
    "Your profile is up to date. What would you like to look into next?";

/// Central orchestrator owning the stages and the session registry.
pub struct AdvisoryEngine {
    classifier: SafetyClassifier,
    router: IntentRouter,
    collector: ProfileCollector,
    retrieval: RetrievalStage,
    debate: DebateStage,
    report: ReportStage,
    store: Arc<dyn ProfileStore>,
    sessions: SessionRegistry,
}

impl AdvisoryEngine {
    /// Production wiring: provider-backed tool catalogs and the document
    /// store as the compliance source.
    pub fn new(backend: Arc<dyn CompletionBackend>, store: Arc<dyn ProfileStore>) -> Self {
        Self::with_compliance_source(backend, store, Arc::new(DocumentSearchClient::from_env()))
    }

    pub fn with_compliance_source(
        backend: Arc<dyn CompletionBackend>,
        store: Arc<dyn ProfileStore>,
        compliance: Arc<dyn ComplianceSource>,
    ) -> Self {
        Self {
            classifier: SafetyClassifier::new(backend.clone()),
            router: IntentRouter::new(backend.clone()),
            collector: ProfileCollector::new(backend.clone(), store.clone()),
            retrieval: RetrievalStage::new(backend.clone(), create_retrieval_registry()),
            debate: DebateStage::new(backend.clone(), create_debate_registry()),
            report: ReportStage::new(backend, create_report_registry(), store.clone(), compliance),
            store,
            sessions: SessionRegistry::new(),
        }
    }

    /// Live session registry, for the transport layer.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Process one user turn. An absent or empty session key starts a
    /// new session with the stored profile preloaded.
    pub async fn process_turn(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        text: &str,
    ) -> Result<TurnResult> {
        let session_key = match session_id.filter(|key| !key.trim().is_empty()) {
            Some(key) => key.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let (handle, created) = self.sessions.get_or_create(&session_key, user_id).await;

        // One turn at a time per session; other sessions are untouched.
        let mut session = handle.lock().await;

        if created {
            match self.store.load_profile(user_id).await {
                Ok(profile) if !profile.is_empty() => {
                    info!(user_id = %user_id, "Stored profile loaded into new session");
                    session.merge_profile(profile);
                }
                Ok(_) => {}
                Err(e) => warn!("Profile preload failed, starting empty: {}", e),
            }
        }

        session.push_user(text);

        let safety = self
            .classifier
            .classify(text, session.previous_assistant_text())
            .await;
        let allowed = safety.allowed;
        session.safety_result = Some(safety);

        if !allowed {
            info!(session = %session_key, "Turn blocked by safety classifier");
            return Ok(TurnResult {
                session_id: session_key,
                stage: StageId::Safety,
                message: None,
                debate_history: None,
            });
        }

        let mut resumes = 0;
        loop {
            let target = self.router.decide(&mut session).await;

            let (stage, outcome) = match target {
                RouteTarget::Terminate => {
                    return Ok(TurnResult {
                        session_id: session_key,
                        stage: StageId::Safety,
                        message: None,
                        debate_history: None,
                    });
                }
                RouteTarget::ProfileCollector => (
                    StageId::ProfileCollector,
                    self.collector.run(&mut session).await,
                ),
                RouteTarget::Retrieval => {
                    (StageId::Retrieval, self.retrieval.run(&mut session).await)
                }
                RouteTarget::Debate => (StageId::Debate, self.debate.run(&mut session).await),
                RouteTarget::Report => (StageId::Report, self.report.run(&mut session).await),
            };

            match outcome {
                Ok(StageOutcome::AwaitUser { message }) => {
                    let debate_history = match stage {
                        StageId::Debate => session.debate_history(),
                        _ => None,
                    };
                    return Ok(TurnResult {
                        session_id: session_key,
                        stage,
                        message: Some(message),
                        debate_history,
                    });
                }
                Ok(StageOutcome::RouterResume) => {
                    resumes += 1;
                    if resumes > MAX_ROUTER_RESUMES {
                        warn!(
                            session = %session_key,
                            "Router resume cap reached, closing the turn"
                        );
                        session.push_assistant(RESUME_CAP_REPLY);
                        return Ok(TurnResult {
                            session_id: session_key,
                            stage,
                            message: Some(RESUME_CAP_REPLY.to_string()),
                            debate_history: None,
                        });
                    }
                }
                Err(e) => {
                    // Stage failure is turn-fatal, never session-fatal.
                    warn!(stage = stage.as_str(), "Stage failed: {}", e);
                    let message = format!(
                        "Sorry, something went wrong while processing your request: {}",
                        e
                    );
                    session.push_assistant(message.clone());
                    return Ok(TurnResult {
                        session_id: session_key,
                        stage,
                        message: Some(message),
                        debate_history: None,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedBackend};
    use crate::store::AdvisoryStore;
    use serde_json::{json, Map, Value};

    struct NoCompliance;

    #[async_trait::async_trait]
    impl ComplianceSource for NoCompliance {
        async fn lookup(&self, _query: &str) -> Result<String> {
            Ok("No related documents found.".to_string())
        }
    }

    fn engine_with(
        responses: Vec<CompletionResponse>,
    ) -> (AdvisoryEngine, Arc<ScriptedBackend>, Arc<AdvisoryStore>) {
        let backend = Arc::new(ScriptedBackend::new(responses));
        let store = Arc::new(AdvisoryStore::in_memory());
        let engine = AdvisoryEngine::with_compliance_source(
            backend.clone(),
            store.clone(),
            Arc::new(NoCompliance),
        );
        (engine, backend, store)
    }

    fn full_profile() -> Map<String, Value> {
        crate::profile::REQUIRED_FIELDS
            .iter()
            .map(|field| (field.to_string(), json!("populated")))
            .collect()
    }

    fn verdict(category: &str) -> CompletionResponse {
        CompletionResponse::text(format!(
            r#"{{"is_allowed": true, "category": "{}", "reason": "test"}}"#,
            category
        ))
    }

    #[tokio::test]
    async fn test_blocked_turn_runs_no_stage() {
        let (engine, backend, _) = engine_with(vec![CompletionResponse::text(
            r#"{"is_allowed": false, "category": "unsafe", "reason": "illegal"}"#,
        )]);

        let result = engine
            .process_turn(None, "user_ext_001", "how do I launder money")
            .await
            .unwrap();

        assert_eq!(result.stage, StageId::Safety);
        assert!(result.message.is_none());
        // Only the classifier spoke to the model.
        assert_eq!(backend.seen_requests().len(), 1);

        // The session survives and stays addressable.
        assert!(engine.sessions().get(&result.session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_retrieval_turn_end_to_end() {
        let (engine, _, store) = engine_with(vec![
            verdict("finance"),
            CompletionResponse::text(r#"{"route": "market_data", "reason": "price query"}"#),
            CompletionResponse::text("Apple trades at $189.20."),
            CompletionResponse::text("Shall we compare it to the Nasdaq?"),
        ]);
        store
            .save_profile("user_ext_001", &full_profile())
            .await
            .unwrap();

        let result = engine
            .process_turn(None, "user_ext_001", "Price of Apple")
            .await
            .unwrap();

        assert_eq!(result.stage, StageId::Retrieval);
        let message = result.message.unwrap();
        assert!(message.contains("$189.20"));
        assert!(result.debate_history.is_none());

        // The stored profile was preloaded into the fresh session.
        let handle = engine.sessions().get(&result.session_id).await.unwrap();
        let session = handle.lock().await;
        assert!(crate::profile::is_complete(&session.profile));
        assert_eq!(session.messages().last().unwrap().text, message);
    }

    #[tokio::test]
    async fn test_substantive_question_is_deferred_during_onboarding() {
        let (engine, _, _) = engine_with(vec![
            verdict("finance"),
            CompletionResponse::text(
                r#"{"name_display": "Dana", "response_message": "Before we dive in - what should I call you?"}"#,
            ),
        ]);

        let turn = engine
            .process_turn(None, "user_ext_001", "Compare Nvidia vs Tesla")
            .await
            .unwrap();

        assert_eq!(turn.stage, StageId::ProfileCollector);
        assert!(turn.message.unwrap().contains("call you"));

        let handle = engine.sessions().get(&turn.session_id).await.unwrap();
        let session = handle.lock().await;
        assert_eq!(
            session.deferred_query.as_deref(),
            Some("Compare Nvidia vs Tesla")
        );
    }

    #[tokio::test]
    async fn test_deferred_query_replays_into_debate() {
        let mut script = vec![
            verdict("finance"),
            CompletionResponse::text(r#"{"route": "investment_advisory", "reason": "comparison"}"#),
        ];
        for i in 0..15 {
            script.push(CompletionResponse::text(format!("argument {}", i)));
        }
        script.push(CompletionResponse::text(
            "Verdict: Nvidia. Shall I run additional research on valuation risk?",
        ));
        let (engine, _, store) = engine_with(script);

        // Onboarding finished out of band; the session still carries the
        // question that was interrupted by it.
        store
            .save_profile("user_ext_001", &full_profile())
            .await
            .unwrap();
        let (handle, _) = engine
            .sessions()
            .get_or_create("s-deferred", "user_ext_001")
            .await;
        {
            let mut session = handle.lock().await;
            session.deferred_query = Some("Compare Nvidia vs Tesla".to_string());
        }

        // Session profile is empty, so the turn enters the collector; the
        // collector finds the stored profile complete, replays the deferred
        // question, and the router sends it into a full debate.
        let turn = engine
            .process_turn(Some("s-deferred"), "user_ext_001", "done")
            .await
            .unwrap();

        assert_eq!(turn.stage, StageId::Debate);
        assert_eq!(turn.debate_history.as_ref().map(Vec::len), Some(15));
        assert!(turn.message.unwrap().contains("additional research"));

        // The replayed question drove the debate topic.
        let session = handle.lock().await;
        assert_eq!(
            session.collected_data["report_topic"],
            json!("Compare Nvidia vs Tesla")
        );
        assert!(session.deferred_query.is_none());
    }

    #[tokio::test]
    async fn test_resume_cap_closes_a_routing_loop() {
        // Complete profile + profile_update category + change keyword:
        // router and collector would hand the turn back and forth forever.
        let (engine, _, store) = engine_with(vec![verdict("profile_update")]);
        store
            .save_profile("user_ext_001", &full_profile())
            .await
            .unwrap();

        let result = engine
            .process_turn(None, "user_ext_001", "Change my income to 80M")
            .await
            .unwrap();

        assert_eq!(result.stage, StageId::ProfileCollector);
        assert_eq!(result.message.as_deref(), Some(RESUME_CAP_REPLY));
    }

    #[tokio::test]
    async fn test_stage_failure_degrades_to_error_message() {
        // Script dries up right after routing: retrieval's completion
        // call fails, but the turn still answers and the session lives.
        let (engine, _, store) = engine_with(vec![
            verdict("finance"),
            CompletionResponse::text(r#"{"route": "market_data", "reason": "price"}"#),
        ]);
        store
            .save_profile("user_ext_001", &full_profile())
            .await
            .unwrap();

        let result = engine
            .process_turn(None, "user_ext_001", "Price of Apple")
            .await
            .unwrap();

        assert_eq!(result.stage, StageId::Retrieval);
        assert!(result
            .message
            .unwrap()
            .contains("something went wrong"));
        assert!(engine.sessions().get(&result.session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_same_session_key_reuses_state() {
        let (engine, _, store) = engine_with(vec![
            verdict("general_chat"),
            CompletionResponse::text("Happy to help!"),
            CompletionResponse::text("Anything else?"),
            verdict("general_chat"),
            CompletionResponse::text("You're welcome."),
            CompletionResponse::text("Anything else?"),
        ]);
        store
            .save_profile("user_ext_001", &full_profile())
            .await
            .unwrap();

        let turn1 = engine
            .process_turn(None, "user_ext_001", "Hello!")
            .await
            .unwrap();
        let turn2 = engine
            .process_turn(Some(&turn1.session_id), "user_ext_001", "Thanks!")
            .await
            .unwrap();

        assert_eq!(turn1.session_id, turn2.session_id);
        assert_eq!(engine.sessions().count().await, 1);

        let handle = engine.sessions().get(&turn1.session_id).await.unwrap();
        let session = handle.lock().await;
        // Two user turns and two assistant replies, in order.
        assert_eq!(session.messages().len(), 4);
        assert_eq!(session.messages()[0].text, "Hello!");
        assert_eq!(session.messages()[2].text, "Thanks!");
    }
}
