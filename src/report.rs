//! Report synthesis stage
//!
//! Produces the final investment report: a mandatory compliance lookup
//! runs before any report content is written, the body comes from a
//! tool-loop completion against a fixed Markdown skeleton, and a legal
//! appendix is concatenated afterwards so compliance visibility cannot
//! be dropped by the model.

use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::{Speaker, StageOutcome};
use crate::state::Session;
use crate::store::ProfileStore;
use crate::toolloop::run_tool_loop;
use crate::tools::{DocumentSearchClient, ToolRegistry};
use crate::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// How many recent turns feed topic derivation when no debate topic
/// is available.
const TOPIC_CONTEXT_TURNS: usize = 10;

/// Low temperature keeps the report factual.
const REPORT_TEMPERATURE: f32 = 0.2;

const TOPIC_PROMPT: &str = "Extract the main financial subject of this conversation \
     (e.g., Samsung Electronics, US Tech ETF). \
     Ignore onboarding small talk, profile questions, and short agreements \
     (\"yes\", \"go ahead\"); surface the substantive financial question that \
     was actually under discussion. Return ONLY the subject name.";

/// Source of the mandatory legal/regulatory lookup. Stages depend on
/// this seam so tests can script compliance results.
#[async_trait::async_trait]
pub trait ComplianceSource: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<String>;
}

#[async_trait::async_trait]
impl ComplianceSource for DocumentSearchClient {
    async fn lookup(&self, query: &str) -> Result<String> {
        self.match_documents(query, 0.5, 3).await
    }
}

/// A lookup counts as successful only when it returned something and
/// that something is not an error or not-found marker.
fn lookup_succeeded(context: &str) -> bool {
    !context.trim().is_empty()
        && !context.contains("No related documents found")
        && !context.contains("Legal search error")
        && !context.contains("Error:")
}

/// The appendix is appended verbatim after the model-generated body;
/// the user-visible output always states whether legal data was used.
fn legal_appendix(query: &str, context: &str, success: bool) -> String {
    let mut appendix = String::from("\n\n---\n\n## Legal Compliance Review\n\n");

    if success {
        let excerpt: String = context.chars().take(500).collect();
        appendix.push_str("**Legal database search completed**\n\n");
        appendix.push_str(&format!("Query: `{}`\n\n", query));
        appendix.push_str("**Retrieved legal documents:**\n\n");
        appendix.push_str(&format!("```\n{}...\n```\n", excerpt));
        appendix.push_str("\n*The full legal context above was incorporated into this report.*");
    } else {
        appendix.push_str("**WARNING: legal search failed**\n\n");
        appendix.push_str(&format!("Query: `{}`\n\n", query));
        appendix.push_str("**Status:** no related legal documents were found.\n\n");
        appendix.push_str(&format!("**Search result:** `{}`\n\n", context));
        appendix.push_str(
            "*No legal data found: this report was written without legal review. \
             Proceed with caution when making investment decisions.*",
        );
    }

    appendix
}

fn build_report_prompt(legal_context: &str, debate_summary: &str, profile: &Map<String, Value>) -> String {
    format!(
        r#"You are the **Chief Investment Officer (CIO)**.
Write a final investment report for the user based on the gathered data.

**CRITICAL: LEGAL COMPLIANCE CHECK**
The following legal/regulatory information was retrieved from our Law Database.
**You MUST include a 'Legal & Compliance Risks' section in your report referencing this data.**
If the data says the investment is illegal or high-risk due to regulations, you MUST warn the user strictly.

<Legal Data>
{}
</Legal Data>

**Report Structure (Markdown):**
# [Title]
## 1. Executive Summary
## 2. Market Analysis (from Debate)
## 3. Product Recommendations (if any)
## 4. Legal & Compliance Risks (MUST use Legal Data above)
## 5. Final Conclusion

Use the `recommend_products` tool to ground the recommendation section in real products.

**Context from Debate Team:**
{}

**User Profile:**
{}"#,
        if legal_context.is_empty() {
            "No specific legal restrictions found."
        } else {
            legal_context
        },
        debate_summary,
        Value::Object(profile.clone())
    )
}

/// Report Synthesis stage
pub struct ReportStage {
    backend: Arc<dyn CompletionBackend>,
    registry: ToolRegistry,
    store: Arc<dyn ProfileStore>,
    compliance: Arc<dyn ComplianceSource>,
}

impl ReportStage {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        registry: ToolRegistry,
        store: Arc<dyn ProfileStore>,
        compliance: Arc<dyn ComplianceSource>,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            compliance,
        }
    }

    pub async fn run(&self, session: &mut Session) -> Result<StageOutcome> {
        let user_query = session.last_user_text().unwrap_or_default().to_string();

        let topic = self.resolve_topic(session).await;
        info!(topic = %topic, "Report synthesis starting");

        // Mandatory compliance lookup, before any report content.
        let legal_query = format!("{} financial regulations compliance restrictions", topic);
        let (legal_context, legal_ok) = self.compliance_lookup(&legal_query).await;

        let debate_summary = match session.debate_history() {
            Some(history) if !history.is_empty() => {
                history[history.len().saturating_sub(3)..].join("\n")
            }
            _ => "No debate history.".to_string(),
        };

        let messages = vec![
            ChatMessage::system(build_report_prompt(
                &legal_context,
                &debate_summary,
                &session.profile,
            )),
            ChatMessage::user(format!(
                "Topic: {}\nUser Query: {}\nFind products and write the final report now.",
                topic, user_query
            )),
        ];

        let body = match run_tool_loop(
            self.backend.as_ref(),
            &self.registry,
            messages,
            REPORT_TEMPERATURE,
        )
        .await
        {
            Ok(body) => body,
            Err(e) => {
                // Stage-fatal for this turn only; the session stays usable.
                warn!("Report generation failed: {}", e);
                let message = format!("An error occurred while generating the report: {}", e);
                session.push_assistant(message.clone());
                return Ok(StageOutcome::AwaitUser { message });
            }
        };

        let report = format!("{}{}", body, legal_appendix(&legal_query, &legal_context, legal_ok));

        if let Err(e) = self
            .store
            .save_report(&session.user_id, &topic, &report)
            .await
        {
            warn!("Report persistence failed: {}", e);
        } else {
            info!(topic = %topic, "Report saved");
        }

        let mut collected = Map::new();
        collected.insert("report_topic".to_string(), json!(topic));
        session.merge_collected(collected);

        session.push_assistant(report.clone());
        Ok(StageOutcome::AwaitUser { message: report })
    }

    async fn compliance_lookup(&self, query: &str) -> (String, bool) {
        match self.compliance.lookup(query).await {
            Ok(context) => {
                let ok = lookup_succeeded(&context);
                if ok {
                    info!(chars = context.len(), "Legal search successful");
                } else {
                    warn!("Legal search returned no results");
                }
                (context, ok)
            }
            Err(e) => {
                warn!("Legal search error: {}", e);
                (format!("Legal search error: {}", e), false)
            }
        }
    }

    /// Prefer the topic the debate stage resolved; otherwise derive one
    /// from recent conversation.
    async fn resolve_topic(&self, session: &Session) -> String {
        if let Some(topic) = session
            .collected_data
            .get("report_topic")
            .and_then(Value::as_str)
            .filter(|topic| !topic.is_empty())
        {
            return topic.to_string();
        }

        let fallback = session.last_user_text().unwrap_or_default().to_string();

        let mut messages: Vec<ChatMessage> = session
            .recent_messages(TOPIC_CONTEXT_TURNS)
            .iter()
            .map(|turn| match turn.speaker {
                Speaker::User => ChatMessage::user(turn.text.clone()),
                Speaker::Assistant => ChatMessage::assistant(turn.text.clone()),
            })
            .collect();
        messages.push(ChatMessage::user(TOPIC_PROMPT));

        match self.backend.complete(CompletionRequest::new(messages)).await {
            Ok(response) => {
                let topic = response.text_content().trim().to_string();
                if topic.is_empty() {
                    fallback
                } else {
                    topic
                }
            }
            Err(e) => {
                warn!("Report topic derivation failed, using raw input: {}", e);
                fallback
            }
        }
    }
}
