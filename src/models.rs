//! Core data models shared across stages

use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One turn in the session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }
}

//
// ================= Safety =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    Finance,
    ProfileUpdate,
    GeneralChat,
    Unsafe,
}

/// Outcome of the safety classifier for one turn. Overwritten each turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyResult {
    pub allowed: bool,
    pub category: SafetyCategory,
    pub reason: String,
}

impl SafetyResult {
    /// Classifier noise must not block legitimate traffic: any parse or
    /// backend failure yields this permissive default.
    pub fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            category: SafetyCategory::Finance,
            reason: reason.into(),
        }
    }
}

//
// ================= Routing =================
//

/// Closed set of dispatch targets. The router produces exactly one of
/// these; dispatch is an exhaustive match, never a string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    ProfileCollector,
    Retrieval,
    Debate,
    Report,
    /// Blocked turn; no stage runs.
    Terminate,
}

/// Which stage produced the turn's reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Safety,
    ProfileCollector,
    Retrieval,
    Debate,
    Report,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Safety => "safety",
            StageId::ProfileCollector => "profile_collector",
            StageId::Retrieval => "retrieval",
            StageId::Debate => "debate",
            StageId::Report => "report",
        }
    }
}

/// What a stage hands back to the engine. `RouterResume` re-enters the
/// router in the same turn; `AwaitUser` ends the turn with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    RouterResume,
    AwaitUser { message: String },
}

/// Result of one fully processed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub session_id: String,
    pub stage: StageId,
    pub message: Option<String>,
    pub debate_history: Option<Vec<String>>,
}

//
// ================= Profile value spaces =================
//
// Categorical profile fields accept only these literals. Extraction
// results outside a set fail deserialization and are never stored.

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeLevel {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Retirement,
    ShortTerm,
    MidTerm,
    LongTerm,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreferredStyle {
    Direct,
    Reassuring,
    Courteous,
    CalmCoach,
    Friendly,
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTolerance::Conservative => "conservative",
            RiskTolerance::Moderate => "moderate",
            RiskTolerance::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for KnowledgeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KnowledgeLevel::Beginner => "beginner",
            KnowledgeLevel::Intermediate => "intermediate",
            KnowledgeLevel::Advanced => "advanced",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for GoalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GoalType::Retirement => "retirement",
            GoalType::ShortTerm => "short_term",
            GoalType::MidTerm => "mid_term",
            GoalType::LongTerm => "long_term",
            GoalType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_fail_open_default() {
        let result = SafetyResult::fail_open("parse failure");
        assert!(result.allowed);
        assert_eq!(result.category, SafetyCategory::Finance);
    }

    #[test]
    fn test_category_wire_format() {
        let cat: SafetyCategory = serde_json::from_str("\"profile_update\"").unwrap();
        assert_eq!(cat, SafetyCategory::ProfileUpdate);
        assert_eq!(
            serde_json::to_string(&SafetyCategory::GeneralChat).unwrap(),
            "\"general_chat\""
        );
    }

    #[test]
    fn test_closed_sets_reject_unknown_literals() {
        assert!(serde_json::from_str::<RiskTolerance>("\"reckless\"").is_err());
        assert!(serde_json::from_str::<GoalType>("\"speculation\"").is_err());
        assert!(serde_json::from_str::<PreferredStyle>("\"sarcastic\"").is_err());

        let risk: RiskTolerance = serde_json::from_str("\"aggressive\"").unwrap();
        assert_eq!(risk, RiskTolerance::Aggressive);
    }
}
