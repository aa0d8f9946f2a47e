//! Chat transport boundary
//!
//! The engine only needs to send and edit messages, answer inline queries and
//! acknowledge callback presses. Everything else about the messenger stays
//! behind this trait.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Messenger chat identifier
pub type ChatId = i64;

/// Identifier of a message inside a chat
pub type MessageId = i64;

/// Text markup understood by the messenger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Html,
    MarkdownV2,
}

/// One inline button as rendered on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Keyboard attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    /// Persistent reply keyboard of button labels
    Keyboard(Vec<Vec<String>>),
    /// Hide any reply keyboard currently shown
    RemoveKeyboard,
    /// Buttons attached to the message itself
    Inline(Vec<Vec<InlineButton>>),
}

/// One entry of an inline-query answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineResult {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Text posted when the user picks the result (HTML)
    pub message_text: String,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code:?}: {description}")]
    Api {
        code: Option<i64>,
        description: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Outbound side of a messenger
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message and return its id
    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        markup: Option<Markup>,
        format: Option<Format>,
    ) -> Result<MessageId, TransportError>;

    /// Replace the text and/or inline keyboard of a sent message.
    ///
    /// `inline` is the complete keyboard the message should carry afterwards;
    /// `None` leaves it without one. When `text` is `None` only the keyboard
    /// is changed.
    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        inline: Option<Vec<Vec<InlineButton>>>,
        format: Option<Format>,
    ) -> Result<(), TransportError>;

    async fn answer_inline(
        &self,
        query_id: &str,
        results: Vec<InlineResult>,
    ) -> Result<(), TransportError>;

    /// Dismiss the client-side progress indicator of a button press
    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;
}
