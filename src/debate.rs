//! Expert debate stage
//!
//! Three fixed personas (Conservative, Aggressive, Balanced) argue over
//! five ordered rounds: opening statement → rebuttal ×2 → deep dive →
//! closing argument. Every persona turn sees the full transcript so far,
//! and a final arbitration call issues the verdict.

use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest};
use crate::models::{Speaker, StageOutcome};
use crate::state::Session;
use crate::toolloop::run_tool_loop;
use crate::tools::ToolRegistry;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEBATE_ROUNDS: usize = 5;

/// User text longer than this is taken verbatim as the debate topic;
/// anything shorter is treated as an ambiguous confirmation.
pub const TOPIC_VERBATIM_THRESHOLD: usize = 15;

/// How many prior turns feed topic recovery for short confirmations.
const TOPIC_CONTEXT_TURNS: usize = 6;

/// One fixed debate persona.
pub struct Persona {
    pub role: &'static str,
    pub title: &'static str,
    pub style: &'static str,
    pub opponent: &'static str,
}

/// Roster in speaking order. Order is part of the protocol: later
/// personas in a round see earlier arguments from the same round.
pub const PERSONAS: [Persona; 3] = [
    Persona {
        role: "Conservative",
        title: "Conservative investment expert",
        style: "risk management first, skeptical, fact-checking, sensitive to regulation and rates",
        opponent: "Aggressive",
    },
    Persona {
        role: "Aggressive",
        title: "Aggressive investment expert",
        style: "future growth focus, innovative technology, optimistic, high risk high return",
        opponent: "Conservative",
    },
    Persona {
        role: "Balanced",
        title: "Balanced investment expert",
        style: "data-driven moderation, reads market flow, reconciles both sides",
        opponent: "Both",
    },
];

/// One entry in the debate transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub argument: String,
}

impl TranscriptEntry {
    pub fn formatted(&self) -> String {
        format!("[{}]: {}", self.speaker, self.argument)
    }
}

fn round_stage_name(round: usize) -> &'static str {
    match round {
        1 => "Round 1: Opening Statement",
        2 => "Round 2: Rebuttal",
        3 => "Round 3: Rebuttal",
        4 => "Round 4: Deep Dive",
        _ => "Round 5: Closing Argument",
    }
}

fn round_instruction(round: usize, persona: &Persona, topic: &str) -> String {
    match round {
        1 => format!(
            "You are the '{}'. Disposition: {}.\n\
             State your core position on the topic '{}' clearly.\n\
             Use the tools ('search_news', 'get_market_data') to back it with data.",
            persona.title, persona.style, topic
        ),
        2 | 3 => format!(
            "You are the '{}'.\n\
             Strongly rebut the preceding debate, especially the arguments of your \
             opposing side, '{}'.\n\
             Point out logical gaps or flaws in their data.\n\
             Use the tools again if you need fresh evidence for the rebuttal.",
            persona.title, persona.opponent
        ),
        4 => format!(
            "You are the '{}'.\n\
             The debate is nearing its end. Analyze in depth the hidden market risks \
             or opportunities everyone is missing.\n\
             Go beyond simple claims: connect your insight to macro trends or the \
             industry cycle.",
            persona.title
        ),
        _ => format!(
            "You are the '{}'.\n\
             This is your final statement. Deliver the closing conclusion that should \
             persuade the investor.\n\
             Summarize why your argument holds and propose a concrete action \
             (buy / sell / hold).",
            persona.title
        ),
    }
}

/// Expert Debate stage
pub struct DebateStage {
    backend: Arc<dyn CompletionBackend>,
    registry: ToolRegistry,
}

impl DebateStage {
    pub fn new(backend: Arc<dyn CompletionBackend>, registry: ToolRegistry) -> Self {
        Self { backend, registry }
    }

    pub async fn run(&self, session: &mut Session) -> Result<StageOutcome> {
        let user_input = session.last_user_text().unwrap_or_default().to_string();

        let topic = self.resolve_topic(&user_input, session).await;
        info!(topic = %topic, "Debate starting");

        let mut transcript: Vec<TranscriptEntry> = Vec::with_capacity(3 * DEBATE_ROUNDS);

        for round in 1..=DEBATE_ROUNDS {
            debug!(stage = round_stage_name(round), "Debate round");

            for persona in &PERSONAS {
                let instruction = round_instruction(round, persona, &topic);
                let argument = self
                    .persona_turn(&topic, &transcript, &instruction)
                    .await?;

                debug!(persona = persona.role, round, "Argument recorded");
                transcript.push(TranscriptEntry {
                    speaker: persona.title.to_string(),
                    argument,
                });
            }
        }

        info!("Debate complete, arbitrating verdict");
        let verdict = self.judge_verdict(&topic, &transcript).await?;

        // Re-resolve so the persisted topic matches what was argued.
        let topic = self.resolve_topic(&user_input, session).await;

        let mut collected = Map::new();
        collected.insert(
            "debate_history".to_string(),
            json!(transcript
                .iter()
                .map(TranscriptEntry::formatted)
                .collect::<Vec<_>>()),
        );
        collected.insert("report_topic".to_string(), json!(topic));
        session.merge_collected(collected);

        session.push_assistant(verdict.clone());
        Ok(StageOutcome::AwaitUser { message: verdict })
    }

    /// One persona argument, tools allowed.
    async fn persona_turn(
        &self,
        topic: &str,
        transcript: &[TranscriptEntry],
        instruction: &str,
    ) -> Result<String> {
        let history_text = if transcript.is_empty() {
            "(First statement)".to_string()
        } else {
            format!(
                "--- Previous debate history ---\n{}\n---------------------",
                transcript
                    .iter()
                    .map(TranscriptEntry::formatted)
                    .collect::<Vec<_>>()
                    .join("\n\n")
            )
        };

        let messages = vec![
            ChatMessage::system(instruction.to_string()),
            ChatMessage::user(format!(
                "Topic: {}\n\n{}\n\nIt's your turn to argue logically.",
                topic, history_text
            )),
        ];

        run_tool_loop(self.backend.as_ref(), &self.registry, messages, 0.7).await
    }

    /// Final arbitration, no tool access.
    async fn judge_verdict(&self, topic: &str, transcript: &[TranscriptEntry]) -> Result<String> {
        let log = transcript
            .iter()
            .map(TranscriptEntry::formatted)
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"You are the Chief Investment Officer (CIO / arbiter) of an AI advisory system.
You have reviewed the 5-round debate of 3 experts on the topic '{}'.

Participants:
1. Conservative investment expert: prioritizes risk management
2. Aggressive investment expert: prioritizes returns
3. Balanced investment expert: seeks the middle ground

**Instructions:**
1. Summarize each expert's core argument.
2. Assess whose argument is the most logical and data-driven.
3. Issue the Final Verdict considering current market conditions.
4. Keep the tone professional and confidence-inspiring.
5. **[IMPORTANT] Find the Missing Link.**
   - Did the debate overlook any risk? (e.g., FX, rates, geopolitics)
   - Is there a point that needs more concrete data?

**Output format:**
- First, brief the debate conclusion.
- Then **proactively suggest**: "Shall I run additional research on ~~ to make the report complete?"
- Only if the debate was already exhaustive, ask whether the user has further questions or wants to approve the report.

**Debate log:**
{}"#,
            topic, log
        );

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_temperature(0.7);

        let response = self.backend.complete(request).await?;
        Ok(response.text_content())
    }

    /// Use the user text verbatim when it is substantive; otherwise
    /// recover the subject under discussion from recent turns.
    async fn resolve_topic(&self, user_input: &str, session: &Session) -> String {
        if user_input.chars().count() > TOPIC_VERBATIM_THRESHOLD {
            return user_input.to_string();
        }

        let mut history_text = String::new();
        for turn in session.recent_messages(TOPIC_CONTEXT_TURNS) {
            let role = match turn.speaker {
                Speaker::User => "User",
                Speaker::Assistant => "AI",
            };
            history_text.push_str(&format!("{}: {}\n", role, turn.text));
        }

        let prompt = format!(
            r#"**Conversation History:**
{}
**User's Last Input:** "{}"

**Task:**
The user agreed to a suggestion ("Yes", "Do it").
Identify the **Main Subject (Company/Ticker/Topic)** discussed in this flow.

- If they were talking about 'Nvidia', the topic is 'Nvidia Stock Volatility Analysis'.
- If 'Samsung', then 'Samsung Electronics Analysis'.

**CRITICAL:** Do NOT hallucinate a new company. Use the one explicitly mentioned in the history.

Output ONLY the topic string."#,
            history_text, user_input
        );

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)]);

        match self.backend.complete(request).await {
            Ok(response) => {
                let topic = response.text_content().trim().to_string();
                if topic.is_empty() {
                    user_input.to_string()
                } else {
                    topic
                }
            }
            Err(e) => {
                warn!("Topic recovery failed, using raw input: {}", e);
                user_input.to_string()
            }
        }
    }
}
