//! Investor profile collection
//!
//! Gates substantive stages behind twelve required profile fields.
//! Two states, recomputed fresh on every invocation: COLLECTING while
//! any field is missing, COMPLETE the instant none are.

use crate::llm::{parse_structured, ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::{GoalType, KnowledgeLevel, PreferredStyle, RiskTolerance, Speaker, StageOutcome};
use crate::state::Session;
use crate::store::ProfileStore;
use crate::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Required fields in fixed ask-priority order:
/// name → demographics → experience → knowledge → holdings/amount →
/// preferences → goals → style.
pub const REQUIRED_FIELDS: &[&str] = &[
    "name_display",
    "age_range",
    "income_bracket",
    "invest_experience_yr",
    "financial_knowledge_level",
    "current_holdings_note",
    "total_investable_amt",
    "preferred_asset_types",
    "risk_tolerance_level",
    "goal_type",
    "goal_description",
    "preferred_style",
];

/// How many recent turns are shown to the extraction call.
const CONTEXT_TURNS: usize = 6;

const TRANSITION_NOTICE: &str =
    "All information has been collected. Starting the analysis of your original question right away!";

fn field_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Missing required fields, in priority order.
pub fn missing_fields(profile: &Map<String, Value>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .filter(|field| profile.get(**field).map_or(true, field_is_empty))
        .copied()
        .collect()
}

/// Completeness is derived, never stored.
pub fn is_complete(profile: &Map<String, Value>) -> bool {
    missing_fields(profile).is_empty()
}

/// Fixed question per field, used when the model supplies no reply text.
pub fn fallback_question_for(field: &str) -> &'static str {
    match field {
        "name_display" => "To get started, what name or nickname should I call you?",
        "age_range" => "Which age bracket are you in (20-29, 30-39, 40-49, 50-59, 60+)?",
        "income_bracket" => {
            "What's your approximate annual income range (under 30M, 30M-50M, 50M-100M, 100M+)?"
        }
        "invest_experience_yr" => "How many years of investment experience do you have?",
        "financial_knowledge_level" => {
            "How would you rate your financial knowledge: beginner, intermediate, or advanced?"
        }
        "current_holdings_note" => "What assets do you currently hold, roughly?",
        "total_investable_amt" => "How much are you able to invest in total?",
        "preferred_asset_types" => {
            "Which asset types do you prefer: stocks, bonds, ETFs, real estate, crypto?"
        }
        "risk_tolerance_level" => {
            "How would you describe your risk appetite: conservative, moderate, or aggressive?"
        }
        "goal_type" => {
            "What is your primary goal: retirement, a short-term, mid-term, or long-term target?"
        }
        "goal_description" => "Could you describe that goal in a bit more detail?",
        "preferred_style" => {
            "How should I talk to you: direct, reassuring, courteous, like a calm coach, or like a friend?"
        }
        _ => "Could you tell me a bit more about your investment situation?",
    }
}

/// Structured extraction target. Categorical fields are closed enums, so
/// out-of-set literals fail deserialization and nothing is stored verbatim.
#[derive(Debug, Default, Deserialize)]
pub struct ExtractedProfile {
    pub name_display: Option<String>,
    pub age_range: Option<String>,
    pub income_bracket: Option<String>,
    pub invest_experience_yr: Option<f64>,
    pub financial_knowledge_level: Option<KnowledgeLevel>,
    pub current_holdings_note: Option<String>,
    pub total_investable_amt: Option<f64>,
    pub preferred_asset_types: Option<Vec<String>>,
    pub risk_tolerance_level: Option<RiskTolerance>,
    pub goal_type: Option<GoalType>,
    pub goal_description: Option<String>,
    pub preferred_style: Option<PreferredStyle>,
    /// Conversational reply for the user; never persisted.
    pub response_message: Option<String>,
}

impl ExtractedProfile {
    /// Persistable field updates (reply text excluded).
    pub fn into_field_updates(self) -> Map<String, Value> {
        let mut updates = Map::new();

        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                updates.insert(key.to_string(), value);
            }
        };

        put("name_display", self.name_display.map(Value::from));
        put("age_range", self.age_range.map(Value::from));
        put("income_bracket", self.income_bracket.map(Value::from));
        put("invest_experience_yr", self.invest_experience_yr.map(Value::from));
        put(
            "financial_knowledge_level",
            self.financial_knowledge_level.map(|v| json!(v)),
        );
        put("current_holdings_note", self.current_holdings_note.map(Value::from));
        put("total_investable_amt", self.total_investable_amt.map(Value::from));
        put(
            "preferred_asset_types",
            self.preferred_asset_types.map(|v| json!(v)),
        );
        put("risk_tolerance_level", self.risk_tolerance_level.map(|v| json!(v)));
        put("goal_type", self.goal_type.map(|v| json!(v)));
        put("goal_description", self.goal_description.map(Value::from));
        put("preferred_style", self.preferred_style.map(|v| json!(v)));

        updates
    }
}

fn build_collection_prompt(profile: &Map<String, Value>, missing: &[&str]) -> String {
    format!(
        r#"You are a friendly Investment Onboarding Assistant.
User Profile Status: {}
Missing Info: {:?}

**Conversation Strategy:**
You need to collect ALL missing fields, but **ask only 1-2 questions at a time**.
Group related topics naturally:
1. **Basics:** Name, Age, Income
2. **Experience:** Investment Years (`invest_experience_yr`), Knowledge Level (`financial_knowledge_level`)
3. **Assets:** Investable Amount, Current Holdings (`current_holdings_note`)
4. **Preferences:** Asset Types (`preferred_asset_types`), Risk Level
5. **Goals:** Goal Type (`goal_type`), Description
6. **Style:** Reply Persona (`preferred_style`)

**CRITICAL - DATA MAPPING RULES:**
You MUST map the user's input to these EXACT values:

1. `risk_tolerance_level`: (ONLY 3 values allowed)
   - safe / cautious / low risk -> 'conservative'
   - neutral / balanced / medium risk -> 'moderate'
   - bold / growth-seeking / high risk -> 'aggressive'

2. `financial_knowledge_level`: ['beginner', 'intermediate', 'advanced']

3. `goal_type`: (ONLY 5 values allowed)
   - 1-2 year target -> 'short_term'
   - 3-5 year target -> 'mid_term'
   - wealth building / long horizon -> 'long_term'
   - retirement planning -> 'retirement'
   - undecided -> 'unknown'

4. `preferred_style`: (ONLY 5 values allowed)
   ['direct', 'reassuring', 'courteous', 'calm_coach', 'friendly']

Output JSON with any extracted fields plus a required `response_message`.
Only include fields you are CERTAIN about from this conversation."#,
        Value::Object(profile.clone()),
        missing
    )
}

/// Profile Collector stage
pub struct ProfileCollector {
    backend: Arc<dyn CompletionBackend>,
    store: Arc<dyn ProfileStore>,
}

impl ProfileCollector {
    pub fn new(backend: Arc<dyn CompletionBackend>, store: Arc<dyn ProfileStore>) -> Self {
        Self { backend, store }
    }

    pub async fn run(&self, session: &mut Session) -> Result<StageOutcome> {
        // Store value merged over the in-memory profile; store wins on
        // conflicting keys.
        match self.store.load_profile(&session.user_id).await {
            Ok(stored) => session.merge_profile(stored),
            Err(e) => warn!("Profile load failed, continuing with session copy: {}", e),
        }

        let missing = missing_fields(&session.profile);

        if missing.is_empty() {
            info!(user_id = %session.user_id, "Profile fully completed");

            if let Some(original_query) = session.deferred_query.take() {
                info!("Restoring deferred query: {}", original_query);
                session.push_assistant(TRANSITION_NOTICE);
                session.push_user(original_query);
            }
            return Ok(StageOutcome::RouterResume);
        }

        info!(
            missing_count = missing.len(),
            "Profile incomplete, collecting"
        );

        let mut messages = vec![ChatMessage::system(build_collection_prompt(
            &session.profile,
            &missing,
        ))];
        for turn in session.recent_messages(CONTEXT_TURNS) {
            messages.push(match turn.speaker {
                Speaker::User => ChatMessage::user(turn.text.clone()),
                Speaker::Assistant => ChatMessage::assistant(turn.text.clone()),
            });
        }

        let request = CompletionRequest::new(messages)
            .with_json_response()
            .with_temperature(0.7);

        let extracted = match self.backend.complete(request).await {
            Ok(response) => match parse_structured::<ExtractedProfile>(&response.text_content()) {
                Ok(extracted) => extracted,
                Err(e) => {
                    // Only successfully parsed extractions may touch the
                    // profile; a rejected literal discards the whole turn.
                    warn!("Profile extraction rejected: {}", e);
                    ExtractedProfile::default()
                }
            },
            Err(e) => {
                warn!("Profile extraction call failed: {}", e);
                ExtractedProfile::default()
            }
        };

        let reply_text = extracted.response_message.clone();
        let updates = extracted.into_field_updates();

        if !updates.is_empty() {
            let field_names: Vec<&String> = updates.keys().collect();
            info!(?field_names, "Profile fields extracted");

            session.merge_profile(updates);
            if let Err(e) = self
                .store
                .save_profile(&session.user_id, &session.profile)
                .await
            {
                warn!("Profile persistence failed: {}", e);
            }
        }

        let reply = match reply_text.filter(|text| !text.is_empty()) {
            Some(text) => text,
            None => {
                let remaining = missing_fields(&session.profile);
                match remaining.first() {
                    Some(field) => fallback_question_for(field).to_string(),
                    None => "That completes your profile. Shall we start investing?".to_string(),
                }
            }
        };

        session.push_assistant(reply.clone());
        Ok(StageOutcome::AwaitUser { message: reply })
    }
}
