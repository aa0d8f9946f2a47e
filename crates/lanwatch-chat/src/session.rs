//! Per-chat sessions and the access allow-list

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::dispatch::Dialog;
use crate::keyboard::InlineKeyboard;
use crate::transport::{ChatId, MessageId};

/// Inline keyboards kept per session; the oldest message loses its binding first
pub const MAX_BOUND_KEYBOARDS: usize = 32;

/// Conversation state of one chat
#[derive(Debug)]
pub struct Session<S, A> {
    pub chat_id: ChatId,
    pub state: S,
    /// Inline keyboards by the message they were sent with
    pub(crate) pending_keyboards: HashMap<MessageId, InlineKeyboard<A>>,
}

impl<S, A> Session<S, A> {
    pub fn new(chat_id: ChatId, state: S) -> Self {
        Self {
            chat_id,
            state,
            pending_keyboards: HashMap::new(),
        }
    }

    /// Keyboard currently bound to a message
    pub fn keyboard(&self, message_id: MessageId) -> Option<&InlineKeyboard<A>> {
        self.pending_keyboards.get(&message_id)
    }

    pub fn bound_keyboards(&self) -> usize {
        self.pending_keyboards.len()
    }

    /// Bind a keyboard to a message, dropping the oldest binding when full.
    /// Message ids grow over time within a chat.
    pub(crate) fn bind_keyboard(&mut self, message_id: MessageId, keyboard: InlineKeyboard<A>) {
        self.pending_keyboards.insert(message_id, keyboard);
        while self.pending_keyboards.len() > MAX_BOUND_KEYBOARDS {
            let Some(oldest) = self.pending_keyboards.keys().min().copied() else {
                break;
            };
            self.pending_keyboards.remove(&oldest);
            debug!(chat_id = self.chat_id, message_id = oldest, "Dropped oldest keyboard binding");
        }
    }
}

pub type SessionHandle<D> =
    Arc<tokio::sync::Mutex<Session<<D as Dialog>::State, <D as Dialog>::Action>>>;

/// Sessions by chat id. Sessions live for the process lifetime.
pub struct SessionStore<D: Dialog> {
    dialog: Arc<D>,
    sessions: Mutex<HashMap<ChatId, SessionHandle<D>>>,
    allowed: RwLock<HashSet<ChatId>>,
}

impl<D: Dialog> SessionStore<D> {
    pub fn new(dialog: Arc<D>) -> Self {
        Self {
            dialog,
            sessions: Mutex::new(HashMap::new()),
            allowed: RwLock::new(HashSet::new()),
        }
    }

    /// Existing session for the chat, or a new one in the initial state
    pub fn get_or_create(&self, chat_id: ChatId) -> SessionHandle<D> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(chat_id)
            .or_insert_with(|| {
                debug!(chat_id = chat_id, "Creating session");
                Arc::new(tokio::sync::Mutex::new(Session::new(
                    chat_id,
                    self.dialog.initial_state(),
                )))
            })
            .clone()
    }

    pub fn allow(&self, chat_id: ChatId) {
        self.allowed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(chat_id);
    }

    pub fn is_allowed(&self, chat_id: ChatId) -> bool {
        self.allowed
            .read()
            .map(|allowed| allowed.contains(&chat_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
