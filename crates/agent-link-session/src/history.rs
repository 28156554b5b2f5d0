//! Mapping stored history records to messages.

use agent_link_core::{
    Attachment, Message, Role,
    traits::HistoryRecord,
};

fn role_of(record: &HistoryRecord) -> Role {
    // Video messages are bot output whatever role they were stored under.
    if record.kind.as_deref() == Some("video") {
        return Role::Assistant;
    }
    match record.role.as_str() {
        "user" | "human" => Role::User,
        "agent" => Role::Agent,
        "system" => Role::System,
        "assistant" | "bot" => Role::Assistant,
        other => {
            tracing::debug!(role = other, "unknown history role, treating as assistant");
            Role::Assistant
        }
    }
}

/// Convert one record into a finished message.
#[must_use]
pub fn to_message(record: HistoryRecord) -> Message {
    let mut message = Message::new(role_of(&record), record.message);
    message.html = record.html;
    match record.video {
        Some(video) => message.with_attachment(Attachment::Video(video)),
        None => message,
    }
}

/// Convert an ordered history into the session's message list.
#[must_use]
pub fn to_messages(records: Vec<HistoryRecord>) -> Vec<Message> {
    records.into_iter().map(to_message).collect()
}

#[cfg(test)]
mod tests {
    use agent_link_core::message::VideoAttachment;

    use super::*;

    fn record(role: &str, message: &str) -> HistoryRecord {
        HistoryRecord {
            role: role.to_string(),
            message: message.to_string(),
            kind: None,
            html: None,
            video: None,
        }
    }

    #[test]
    fn test_roles() {
        let messages = to_messages(vec![record("user", "hi"), record("assistant", "hello")]);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages.iter().all(|m| m.done && !m.loading));
    }

    #[test]
    fn test_video_system_message_is_assistant() {
        let video = VideoAttachment {
            url: "https://v.test/1".into(),
            title: Some("Intro".into()),
            thumbnail_url: None,
        };
        let message = to_message(HistoryRecord {
            kind: Some("video".into()),
            video: Some(video.clone()),
            ..record("system", "")
        });
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.attachment, Some(Attachment::Video(video)));
    }

    #[test]
    fn test_plain_system_message_keeps_role() {
        assert_eq!(to_message(record("system", "joined")).role, Role::System);
    }
}
