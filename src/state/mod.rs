//! Shared session state
//!
//! One `Session` is threaded through every stage of a turn. The message
//! log is append-only; profile and collected data are merge-updated;
//! the safety result is overwritten each turn.

use crate::models::{ChatTurn, SafetyResult, Speaker};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Merge `right` over `left`: new keys are set, existing keys are
/// overwritten, nothing is ever deleted.
pub fn merge_values(left: &mut Map<String, Value>, right: Map<String, Value>) {
    for (key, value) in right {
        left.insert(key, value);
    }
}

/// Per-session state shared by all stages.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    /// Append-only transcript. Private: stages may append, never reorder
    /// or truncate; history length is clamped only at read time.
    messages: Vec<ChatTurn>,
    pub profile: Map<String, Value>,
    /// Scratch channel between stages (debate transcript, resolved topic).
    pub collected_data: Map<String, Value>,
    pub safety_result: Option<SafetyResult>,
    /// Original question saved when profile collection interrupts it.
    pub deferred_query: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            messages: Vec::new(),
            profile: Map::new(),
            collected_data: Map::new(),
            safety_result: None,
            deferred_query: None,
        }
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.messages.push(turn);
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatTurn::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(ChatTurn::assistant(text));
    }

    pub fn messages(&self) -> &[ChatTurn] {
        &self.messages
    }

    /// The last `count` turns, oldest first.
    pub fn recent_messages(&self, count: usize) -> &[ChatTurn] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// Text of the most recent user turn.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::User)
            .map(|turn| turn.text.as_str())
    }

    /// The assistant turn immediately preceding the latest user turn,
    /// used to disambiguate short replies like "yes".
    pub fn previous_assistant_text(&self) -> Option<&str> {
        let last_user = self
            .messages
            .iter()
            .rposition(|turn| turn.speaker == Speaker::User)?;
        if last_user == 0 {
            return None;
        }
        let prior = &self.messages[last_user - 1];
        (prior.speaker == Speaker::Assistant).then_some(prior.text.as_str())
    }

    pub fn merge_profile(&mut self, updates: Map<String, Value>) {
        merge_values(&mut self.profile, updates);
    }

    pub fn merge_collected(&mut self, updates: Map<String, Value>) {
        merge_values(&mut self.collected_data, updates);
    }

    /// Debate transcript lines from the scratch channel, if a debate ran.
    pub fn debate_history(&self) -> Option<Vec<String>> {
        self.collected_data
            .get("debate_history")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
    }
}

/// Registry of live sessions keyed by opaque session key.
///
/// The registry lock covers only insert/lookup/delete; each session's
/// mutex serializes its turn processing, so distinct sessions proceed
/// concurrently with no shared mutable state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Returns the session handle and whether it was created by this call.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> (Arc<Mutex<Session>>, bool) {
        {
            let sessions = self.sessions.read().await;
            if let Some(existing) = sessions.get(session_id) {
                return (existing.clone(), false);
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Mutex::new(Session::new(session_id, user_id)));
        sessions.insert(session_id.to_string(), session.clone());
        (session, true)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).is_some()
    }

    pub async fn session_keys(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_messages_append_only_with_read_clamp() {
        let mut session = Session::new("s1", "user_ext_001");
        for i in 0..10 {
            session.push_user(format!("question {}", i));
            session.push_assistant(format!("answer {}", i));
        }

        assert_eq!(session.messages().len(), 20);
        let recent = session.recent_messages(6);
        assert_eq!(recent.len(), 6);
        assert_eq!(recent[0].text, "question 7");
        // Clamping the read did not touch the log itself.
        assert_eq!(session.messages().len(), 20);
    }

    #[test]
    fn test_merge_disjoint_sets_equals_single_merge() {
        let mut stepwise = Session::new("s1", "u1");
        stepwise.merge_profile(map(&[("age_range", json!("30-39"))]));
        stepwise.merge_profile(map(&[("income_bracket", json!("50M-100M"))]));

        let mut single = Session::new("s2", "u1");
        single.merge_profile(map(&[
            ("age_range", json!("30-39")),
            ("income_bracket", json!("50M-100M")),
        ]));

        assert_eq!(stepwise.profile, single.profile);
    }

    #[test]
    fn test_merge_is_idempotent_and_overwrites() {
        let mut session = Session::new("s1", "u1");
        session.merge_profile(map(&[("age_range", json!("30-39"))]));
        session.merge_profile(map(&[("age_range", json!("30-39"))]));
        assert_eq!(session.profile.len(), 1);

        session.merge_profile(map(&[("age_range", json!("40-49"))]));
        assert_eq!(session.profile["age_range"], json!("40-49"));
    }

    #[test]
    fn test_previous_assistant_text() {
        let mut session = Session::new("s1", "u1");
        session.push_user("Compare Nvidia vs Tesla");
        assert_eq!(session.previous_assistant_text(), None);

        session.push_assistant("Shall I run a deeper comparison?");
        session.push_user("Yes");
        assert_eq!(
            session.previous_assistant_text(),
            Some("Shall I run a deeper comparison?")
        );
        assert_eq!(session.last_user_text(), Some("Yes"));
    }

    #[tokio::test]
    async fn test_registry_create_and_remove() {
        let registry = SessionRegistry::new();
        let (_, created) = registry.get_or_create("s1", "u1").await;
        assert!(created);
        let (_, created_again) = registry.get_or_create("s1", "u1").await;
        assert!(!created_again);

        assert_eq!(registry.count().await, 1);
        assert!(registry.remove("s1").await);
        assert!(!registry.remove("s1").await);
        assert_eq!(registry.count().await, 0);
    }
}
