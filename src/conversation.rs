//! Conversation history handed to the language model.

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Storage seam for the chat history.
///
/// Persistent backends live outside this crate; [`Conversation`] is the
/// in-memory default.
pub trait History: Send {
    fn append(&mut self, role: Role, content: &str);

    fn history(&self) -> Vec<Message>;
}

/// In-memory history that merges consecutive messages from the same role.
///
/// Merging is what lets transcript fragments from an aborted turn flow into
/// the next prompt as a single user message.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation seeded with a system prompt (ignored when empty).
    pub fn with_system_prompt(prompt: &str) -> Self {
        let mut conversation = Self::new();
        conversation.append(Role::System, prompt);
        conversation
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

    /// Drop everything except the system prompt.
    pub fn reset(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
        self.messages.truncate(1);
    }

    /// Serialize as the `[{"role": .., "content": ..}]` array chat APIs take.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.messages)
    }
}

impl History for Conversation {
    fn append(&mut self, role: Role, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        match self.messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push(' ');
                last.content.push_str(content);
            }
            _ => self.messages.push(Message::new(role, content)),
        }
    }

    fn history(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
