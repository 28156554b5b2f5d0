//! Chat message model.

use serde::{Deserialize, Serialize};

/// Text shown on a message whose exchange failed.
///
/// Backend error text is never shown to the user; it is only logged.
pub const GENERIC_ERROR_TEXT: &str = "Something went wrong. Please try again.";

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Bot output.
    Assistant,
    /// The local user.
    User,
    /// A human agent that took over the conversation.
    Agent,
    /// System notices.
    System,
}

/// Video metadata attached to bot output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAttachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// A reference the assistant cited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Structured payload carried next to the message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Video(VideoAttachment),
    Sources { sources: Vec<SourceLink> },
}

/// One entry of a session's conversation.
///
/// Content only grows while `loading` is set; once `done` is set the
/// message is never touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub loading: bool,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Stream boundary tag; only meaningful during reassembly.
    #[serde(skip)]
    pub(crate) stream_id: Option<String>,
}

impl Message {
    /// A finished message with the given role and text.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            html: None,
            loading: false,
            done: true,
            error_text: None,
            attachment: None,
            stream_id: None,
        }
    }

    /// A user message as typed locally.
    #[must_use]
    pub fn user(content: impl Into<String>, html: Option<String>) -> Self {
        Self {
            html,
            ..Self::new(Role::User, content)
        }
    }

    /// An empty assistant message waiting for streamed content.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::streaming(String::new(), None)
    }

    pub(crate) fn streaming(content: String, stream_id: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            html: None,
            loading: true,
            done: false,
            error_text: None,
            attachment: None,
            stream_id,
        }
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Whether this message can still receive streamed content.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.role, Role::Assistant) && self.loading && !self.done
    }

    /// Finalize the message with an error shown to the user.
    pub fn fail(&mut self, error_text: impl Into<String>) {
        self.error_text = Some(error_text.into());
        self.loading = false;
        self.done = true;
    }

    /// Finalize the message as complete.
    pub fn finish(&mut self) {
        self.loading = false;
        self.done = true;
    }
}
