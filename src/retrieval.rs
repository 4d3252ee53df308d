//! Information retrieval stage
//!
//! Answers factual queries by picking the right data source through the
//! tool loop, then appends a consultant-style follow-up suggestion.

use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::StageOutcome;
use crate::state::Session;
use crate::toolloop::run_tool_loop;
use crate::tools::ToolRegistry;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

const RETRIEVER_PROMPT: &str = r#"You are a Financial Information Specialist.
Analyze the user's request and retrieve accurate data using tools.

**Tool Selection Strategy:**
1. Use `search_products` for product searches.
   - **CRITICAL RULE for `keyword`**:
     - Use ONLY nouns (Subject/Sector). **NEVER** use adjectives like "cheap", "best".
     - **GLOBAL SEARCH:** If the user does NOT specify a subject (e.g., just says "Find lowest fee product"), leave `keyword` and `category` empty. Just set `sort_by`.
   - **CRITICAL RULE for `sort_by`**:
     - "Cheap/Low fee" -> `sort_by="fees_asc"`
     - "High return/Best" -> `sort_by="return_desc"`

2. Use `search_documents` for concepts (e.g., "What is ETF?").
3. Use `get_market_price` for stock prices.
4. Use `search_web` for news.

**Action:**
- Do NOT ask clarifying questions (e.g., "Which category?"). **Just search first.**
- Only ask questions AFTER showing the initial search results."#;

/// Information Retrieval stage
pub struct RetrievalStage {
    backend: Arc<dyn CompletionBackend>,
    registry: ToolRegistry,
}

impl RetrievalStage {
    pub fn new(backend: Arc<dyn CompletionBackend>, registry: ToolRegistry) -> Self {
        Self { backend, registry }
    }

    pub async fn run(&self, session: &mut Session) -> Result<StageOutcome> {
        let user_query = session.last_user_text().unwrap_or_default().to_string();
        info!(query = %user_query, "Retrieval analysis");

        let messages = vec![
            ChatMessage::system(RETRIEVER_PROMPT),
            ChatMessage::user(user_query.clone()),
        ];

        let final_response =
            run_tool_loop(self.backend.as_ref(), &self.registry, messages, 0.0).await?;

        let message = match self.suggest_follow_up(&user_query, &final_response).await {
            Some(suggestion) => format!("{}\n\n---\n{}", final_response, suggestion),
            None => final_response,
        };

        session.push_assistant(message.clone());
        Ok(StageOutcome::AwaitUser { message })
    }

    /// Consultant pass: propose the next narrowing step when the results
    /// warrant one. Skipped silently when the call fails.
    async fn suggest_follow_up(&self, user_query: &str, results: &str) -> Option<String> {
        let advisor_prompt = format!(
            r#"User's question: "{}"
Search results: "{}"

You are a meticulous investment consultant.
When showing the search results, if additional information is needed before a report could be written, suggest it specifically.
(e.g., "Shall we narrow these down to strong dividend payers?", "Shall we compare their 1-year returns?")

**If the search results are already sufficient, do not ask unnecessary questions.**
Write in a polite and professional manner."#,
            user_query, results
        );

        let request = CompletionRequest::new(vec![ChatMessage::user(advisor_prompt)]);

        match self.backend.complete(request).await {
            Ok(response) => {
                let text = response.text_content();
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                warn!("Follow-up suggestion failed, returning raw results: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedBackend};
    use crate::tools::Tool;
    use serde_json::{json, Value};

    struct CannedPriceTool;

    #[async_trait::async_trait]
    impl Tool for CannedPriceTool {
        fn name(&self) -> &'static str {
            "get_market_price"
        }

        fn description(&self) -> &'static str {
            "Get the real-time price for a specific ticker."
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "ticker": { "type": "string" } },
                "required": ["ticker"]
            })
        }

        async fn execute(&self, _arguments: &Value) -> crate::Result<String> {
            Ok(r#"{"ticker":"AAPL","price":189.2}"#.to_string())
        }
    }

    fn test_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(std::sync::Arc::new(CannedPriceTool));
        registry
    }

    #[tokio::test]
    async fn test_answer_with_follow_up_suggestion() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            CompletionResponse::tool_call("call_1", "get_market_price", json!({"ticker": "AAPL"})),
            CompletionResponse::text("Apple trades at $189.20."),
            CompletionResponse::text("Shall we compare it against the Nasdaq index?"),
        ]));
        let stage = RetrievalStage::new(backend, test_registry());

        let mut session = Session::new("s1", "u1");
        session.push_user("Price of Apple");

        let outcome = stage.run(&mut session).await.unwrap();
        match outcome {
            StageOutcome::AwaitUser { message } => {
                assert!(message.starts_with("Apple trades at $189.20."));
                assert!(message.contains("---"));
                assert!(message.contains("Nasdaq index"));
                assert_eq!(session.messages().last().unwrap().text, message);
            }
            other => panic!("expected AwaitUser, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_follow_up_failure_degrades_to_raw_answer() {
        // Script runs dry after the main answer; the suggestion pass
        // fails and the raw result is still returned.
        let backend = Arc::new(ScriptedBackend::new(vec![CompletionResponse::text(
            "Apple trades at $189.20.",
        )]));
        let stage = RetrievalStage::new(backend, test_registry());

        let mut session = Session::new("s1", "u1");
        session.push_user("Price of Apple");

        let outcome = stage.run(&mut session).await.unwrap();
        match outcome {
            StageOutcome::AwaitUser { message } => {
                assert_eq!(message, "Apple trades at $189.20.");
            }
            other => panic!("expected AwaitUser, got {:?}", other),
        }
    }
}
