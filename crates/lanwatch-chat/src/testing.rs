//! In-memory transport that records outgoing traffic

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::transport::{
    ChatId, ChatTransport, Format, InlineButton, InlineResult, Markup, MessageId, TransportError,
};

/// One call made on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Message {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        markup: Option<Markup>,
        format: Option<Format>,
    },
    Edit {
        chat_id: ChatId,
        message_id: MessageId,
        text: Option<String>,
        inline: Option<Vec<Vec<InlineButton>>>,
    },
    InlineAnswer {
        query_id: String,
        results: Vec<InlineResult>,
    },
    CallbackAnswer {
        callback_id: String,
    },
}

/// Transport that never leaves the process. Message ids count up from 1.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    log: Mutex<Vec<Outgoing>>,
    last_id: AtomicI64,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `send` and `edit` fail
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn outgoing(&self) -> Vec<Outgoing> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Texts of sent messages, in order
    pub fn texts(&self) -> Vec<String> {
        self.outgoing()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Message { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn last_message(&self) -> Option<Outgoing> {
        self.outgoing()
            .into_iter()
            .rev()
            .find(|o| matches!(o, Outgoing::Message { .. }))
    }

    pub fn clear(&self) {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn record(&self, outgoing: Outgoing) {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(outgoing);
    }

    fn check_failing(&self) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Api {
                code: Some(502),
                description: "Bad Gateway".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        markup: Option<Markup>,
        format: Option<Format>,
    ) -> Result<MessageId, TransportError> {
        self.check_failing()?;
        let message_id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(Outgoing::Message {
            chat_id,
            message_id,
            text: text.to_string(),
            markup,
            format,
        });
        Ok(message_id)
    }

    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        inline: Option<Vec<Vec<InlineButton>>>,
        _format: Option<Format>,
    ) -> Result<(), TransportError> {
        self.check_failing()?;
        self.record(Outgoing::Edit {
            chat_id,
            message_id,
            text: text.map(str::to_string),
            inline,
        });
        Ok(())
    }

    async fn answer_inline(
        &self,
        query_id: &str,
        results: Vec<InlineResult>,
    ) -> Result<(), TransportError> {
        self.record(Outgoing::InlineAnswer {
            query_id: query_id.to_string(),
            results,
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.record(Outgoing::CallbackAnswer {
            callback_id: callback_id.to_string(),
        });
        Ok(())
    }
}
