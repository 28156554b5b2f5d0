//! Folds streamed content fragments into discrete messages.

use crate::message::{Attachment, GENERIC_ERROR_TEXT, Message, SourceLink};

/// A piece of streamed assistant output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentFragment {
    pub text: String,
    /// Fragments sharing an id belong to the same message.
    pub stream_id: Option<String>,
    /// Set on the last fragment of an exchange.
    pub done: bool,
    pub sources: Option<Vec<SourceLink>>,
}

impl ContentFragment {
    /// Plain text fragment without a boundary id.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Set the stream boundary id.
    #[must_use]
    pub fn in_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Mark this fragment as the terminal one.
    #[must_use]
    pub const fn terminal(mut self) -> Self {
        self.done = true;
        self
    }
}

/// Input event for the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Content(ContentFragment),
    /// The backend reported a failure; the raw reason is for logs only.
    Error { reason: String },
}

/// What a fragment did to the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Index of the message that changed.
    pub index: usize,
    /// Whether the message was appended rather than updated.
    pub added: bool,
    /// Whether the exchange is over.
    pub terminal: bool,
}

/// Stateful fold over fragments.
///
/// Only the tail message is ever mutated. Everything before it is left
/// exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct Reassembler {
    last_stream_id: Option<String>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last seen boundary id. Called when a new exchange starts.
    pub fn reset(&mut self) {
        self.last_stream_id = None;
    }

    /// Apply one fragment to `messages`.
    pub fn apply(&mut self, messages: &mut Vec<Message>, fragment: Fragment) -> Applied {
        match fragment {
            Fragment::Content(content) => self.apply_content(messages, content),
            Fragment::Error { reason } => {
                tracing::debug!(%reason, "backend error fragment");
                let (index, added) = open_or_push_tail(messages);
                messages[index].fail(GENERIC_ERROR_TEXT);
                Applied {
                    index,
                    added,
                    terminal: true,
                }
            }
        }
    }

    fn apply_content(&mut self, messages: &mut Vec<Message>, fragment: ContentFragment) -> Applied {
        let ContentFragment {
            text,
            stream_id,
            done,
            sources,
        } = fragment;

        let tail_open = messages.last().is_some_and(Message::is_open);
        let continues_tail = match (&stream_id, tail_open) {
            (_, false) => false,
            (None, true) => true,
            (Some(id), true) => {
                self.last_stream_id.as_ref() == Some(id) || is_placeholder(messages.last())
            }
        };

        let added = if continues_tail {
            let tail = messages.len() - 1;
            messages[tail].content.push_str(&text);
            if messages[tail].stream_id.is_none() {
                messages[tail].stream_id.clone_from(&stream_id);
            }
            false
        } else {
            messages.push(Message::streaming(text, stream_id.clone()));
            true
        };
        if stream_id.is_some() {
            self.last_stream_id = stream_id;
        }

        let index = messages.len() - 1;
        let tail = &mut messages[index];
        if let Some(sources) = sources.filter(|s| !s.is_empty()) {
            tail.attachment = Some(Attachment::Sources { sources });
        }
        if done {
            tail.finish();
        }

        Applied {
            index,
            added,
            terminal: done,
        }
    }
}

fn is_placeholder(message: Option<&Message>) -> bool {
    message.is_some_and(|m| m.is_open() && m.content.is_empty() && m.stream_id.is_none())
}

fn open_or_push_tail(messages: &mut Vec<Message>) -> (usize, bool) {
    if messages.last().is_some_and(Message::is_open) {
        (messages.len() - 1, false)
    } else {
        messages.push(Message::placeholder());
        (messages.len() - 1, true)
    }
}

/// Materialize a message list from an ordered fragment sequence.
///
/// Deterministic: the same input always yields the same output.
#[must_use]
pub fn reassemble(fragments: impl IntoIterator<Item = Fragment>) -> Vec<Message> {
    let mut reassembler = Reassembler::new();
    let mut messages = Vec::new();
    for fragment in fragments {
        reassembler.apply(&mut messages, fragment);
    }
    messages
}
