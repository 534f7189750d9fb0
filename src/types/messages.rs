//! Message types for model conversations.

use serde::{Deserialize, Serialize};

use super::content::ContentBlock;

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user/human
    User,
    /// Message from the AI assistant
    Assistant,
    /// System message (instructions, context)
    System,
}

/// Message content: a plain string or an ordered list of blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Total characters across text parts, used for logging instead of the text itself
    pub fn text_len(&self) -> usize {
        match self {
            MessageContent::Text(text) => text.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .map(|t| t.chars().count())
                .sum(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,
    /// Text or content blocks that make up this message
    pub content: MessageContent,
}

impl Message {
    /// Create a new user message
    pub fn user<C: Into<MessageContent>>(content: C) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create a new assistant message
    pub fn assistant<C: Into<MessageContent>>(content: C) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a new system message
    pub fn system<C: Into<MessageContent>>(content: C) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a new message with the specified role and content
    pub fn new<C: Into<MessageContent>>(role: MessageRole, content: C) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Get the text content of this message
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// An ordered conversation; the first message is conventionally the system prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Messages {
    /// The list of messages in chronological order
    pub messages: Vec<Message>,
}

impl Messages {
    /// Create a new empty message collection
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// System prompt followed by a single user message, the common agent shape
    pub fn from_prompt(system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(user_prompt)],
        }
    }

    /// Add a message to the collection
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get the last user message
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|msg| msg.role == MessageRole::User)
    }

    /// Get all messages from a specific role
    pub fn messages_by_role(&self, role: MessageRole) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|msg| msg.role == role)
            .collect()
    }

    /// Total characters across every message, for logging
    pub fn total_text_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.text_len()).sum()
    }
}

impl std::ops::Deref for Messages {
    type Target = Vec<Message>;

    fn deref(&self) -> &Self::Target {
        &self.messages
    }
}

impl std::ops::DerefMut for Messages {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.messages
    }
}

impl From<Vec<Message>> for Messages {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
