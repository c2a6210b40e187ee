//! Session: one conversation's append-only transcript.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::message::{AssistantMessage, Message, StopReason, ToolCall};

/// An ordered transcript plus its metadata.
///
/// [`Session::append`] is the only mutator. Ordering rules between tool
/// calls and tool results are enforced by whoever appends (the agent loop),
/// and checked by [`Session::validate_ready`] before a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: String,
    system_prompt: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl Session {
    /// Start an empty session with a fresh UUID v4 id.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            system_prompt: system_prompt.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Reconstitute a session from persisted parts.
    pub fn from_parts(
        id: String,
        system_prompt: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            id,
            system_prompt,
            created_at,
            updated_at,
            messages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Append a message and bump `updated_at`.
    pub fn append(&mut self, message: impl Into<Message>) {
        self.messages.push(message.into());
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_assistant(&self) -> Option<&AssistantMessage> {
        self.messages.iter().rev().find_map(Message::as_assistant)
    }

    /// Tool calls of the most recent assistant message that have no
    /// matching tool result after it.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(position) = self
            .messages
            .iter()
            .rposition(|m| matches!(m, Message::Assistant(_)))
        else {
            return Vec::new();
        };
        let Message::Assistant(assistant) = &self.messages[position] else {
            return Vec::new();
        };

        let answered: HashSet<&str> = self.messages[position + 1..]
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult(result) => Some(result.tool_call_id.as_str()),
                _ => None,
            })
            .collect();

        assistant
            .tool_calls()
            .into_iter()
            .filter(|call| !answered.contains(call.id.as_str()))
            .collect()
    }

    /// Check that the transcript can be sent to a model as-is.
    ///
    /// - the session is not empty
    /// - it does not end on an assistant message
    /// - every tool result answers a call in the nearest preceding
    ///   assistant message
    /// - every call of an assistant turn that stopped for tool use is
    ///   answered before the conversation moves on
    ///
    /// Calls inside turns that ended any other way (an aborted stream, for
    /// instance) were never dispatched and need no answer.
    pub fn validate_ready(&self) -> Result<(), ValidationError> {
        if self.messages.is_empty() {
            return Err(ValidationError::EmptySession);
        }
        if matches!(self.messages.last(), Some(Message::Assistant(_))) {
            return Err(ValidationError::AwaitingUserInput);
        }

        // Calls of the current assistant turn, and which of them must be answered
        let mut calls: HashSet<String> = HashSet::new();
        let mut outstanding: Vec<String> = Vec::new();

        for message in &self.messages {
            match message {
                Message::Assistant(assistant) => {
                    check_answered(&outstanding)?;
                    let turn_calls = assistant.tool_calls();
                    calls = turn_calls.iter().map(|c| c.id.clone()).collect();
                    outstanding = if assistant.stop_reason == StopReason::ToolUse {
                        turn_calls.into_iter().map(|c| c.id).collect()
                    } else {
                        Vec::new()
                    };
                }
                Message::ToolResult(result) => {
                    if !calls.contains(&result.tool_call_id) {
                        return Err(ValidationError::OrphanToolResult {
                            tool_call_id: result.tool_call_id.clone(),
                        });
                    }
                    outstanding.retain(|id| *id != result.tool_call_id);
                }
                Message::User(_) => {
                    check_answered(&outstanding)?;
                    calls.clear();
                    outstanding.clear();
                }
            }
        }

        check_answered(&outstanding)
    }
}

fn check_answered(outstanding: &[String]) -> Result<(), ValidationError> {
    match outstanding.first() {
        Some(id) => Err(ValidationError::MissingToolResult {
            tool_call_id: id.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentBlock;

    fn tool_turn(ids: &[&str]) -> AssistantMessage {
        AssistantMessage::new(
            ids.iter()
                .map(|id| ContentBlock::tool_call(*id, "read", "{}"))
                .collect(),
            StopReason::ToolUse,
        )
    }

    fn result(id: &str) -> Message {
        Message::tool_result(id, "read", vec![ContentBlock::text("ok")], false)
    }

    #[test]
    fn new_session_is_empty_with_uuid() {
        let session = Session::new("You are helpful.");
        assert!(session.is_empty());
        assert_eq!(session.system_prompt(), "You are helpful.");
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert_eq!(session.created_at(), session.updated_at());
    }

    #[test]
    fn append_bumps_updated_at() {
        let mut session = Session::new("");
        let before = session.updated_at();
        session.append(Message::user("hi"));
        assert_eq!(session.len(), 1);
        assert!(session.updated_at() >= before);
        assert_eq!(session.created_at(), before);
    }

    #[test]
    fn empty_session_is_not_ready() {
        assert_eq!(
            Session::new("").validate_ready(),
            Err(ValidationError::EmptySession)
        );
    }

    #[test]
    fn trailing_assistant_is_not_ready() {
        let mut session = Session::new("");
        session.append(Message::user("hi"));
        session.append(AssistantMessage::new(
            vec![ContentBlock::text("hello")],
            StopReason::EndTurn,
        ));
        assert_eq!(
            session.validate_ready(),
            Err(ValidationError::AwaitingUserInput)
        );

        session.append(Message::user("again"));
        assert!(session.validate_ready().is_ok());
    }

    #[test]
    fn answered_tool_turn_is_ready() {
        let mut session = Session::new("");
        session.append(Message::user("read both"));
        session.append(tool_turn(&["a", "b"]));
        session.append(result("a"));
        session.append(result("b"));
        assert!(session.validate_ready().is_ok());
        assert!(session.pending_tool_calls().is_empty());
    }

    #[test]
    fn missing_result_is_detected() {
        let mut session = Session::new("");
        session.append(Message::user("read both"));
        session.append(tool_turn(&["a", "b"]));
        session.append(result("a"));
        assert_eq!(
            session.validate_ready(),
            Err(ValidationError::MissingToolResult {
                tool_call_id: "b".into()
            })
        );
        let pending = session.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[test]
    fn orphan_result_is_detected() {
        let mut session = Session::new("");
        session.append(Message::user("hi"));
        session.append(tool_turn(&["a"]));
        session.append(result("zzz"));
        assert_eq!(
            session.validate_ready(),
            Err(ValidationError::OrphanToolResult {
                tool_call_id: "zzz".into()
            })
        );
    }

    #[test]
    fn result_after_user_message_is_orphaned() {
        let mut session = Session::new("");
        session.append(Message::user("hi"));
        session.append(AssistantMessage::new(
            vec![ContentBlock::tool_call("a", "read", "{")],
            StopReason::Aborted,
        ));
        session.append(Message::user("never mind"));
        session.append(result("a"));
        assert!(matches!(
            session.validate_ready(),
            Err(ValidationError::OrphanToolResult { .. })
        ));
    }

    #[test]
    fn aborted_tool_turn_needs_no_results() {
        let mut session = Session::new("");
        session.append(Message::user("hi"));
        session.append(AssistantMessage::new(
            vec![ContentBlock::tool_call("a", "read", r#"{"pa"#)],
            StopReason::Aborted,
        ));
        session.append(Message::user("try again"));
        assert!(session.validate_ready().is_ok());
    }

    #[test]
    fn last_assistant_skips_trailing_results() {
        let mut session = Session::new("");
        session.append(Message::user("hi"));
        session.append(tool_turn(&["a"]));
        session.append(result("a"));
        let last = session.last_assistant().unwrap();
        assert_eq!(last.stop_reason, StopReason::ToolUse);
        assert!(matches!(session.last(), Some(Message::ToolResult(_))));
    }
}
