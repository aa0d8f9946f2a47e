//! Conversational dispatch engine
//!
//! Every chat has a [`Session`] holding the current state of a [`Dialog`].
//! Inbound events are resolved against the state's [`Layout`] (or, for button
//! presses, against the inline keyboard bound to the pressed message) and
//! exactly one handler runs per event while the session is locked.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::keyboard::{InlineKeyboard, Layout};
use crate::session::{Session, SessionStore};
use crate::transport::{
    ChatId, ChatTransport, Format, InlineResult, Markup, MessageId, TransportError,
};

/// What matched an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Command token matched; `rest` is the text after the first whitespace
    Command { rest: String },
    /// Whole text equalled a reply-keyboard label
    Button,
    /// A registered pattern matched the full text
    Pattern { text: String },
    /// Nothing else matched
    Text { text: String },
    /// Inline-keyboard press on a bound message
    Callback { message_id: MessageId, data: String },
    /// Pushed by the application rather than the user
    Trigger,
}

impl Input {
    /// Free text carried by the input, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Command { rest } => Some(rest),
            Self::Pattern { text } | Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// An application conversation: its states, their bindings and the handlers
#[async_trait]
pub trait Dialog: Send + Sync + Sized + 'static {
    type State: Clone + Debug + Send + Sync + 'static;
    type Action: Clone + Debug + Send + Sync + 'static;

    fn initial_state(&self) -> Self::State;

    fn layout(&self, state: &Self::State) -> Layout<Self::Action>;

    async fn handle(
        &self,
        ctx: &mut Context<'_, Self>,
        action: Self::Action,
        input: Input,
    ) -> anyhow::Result<()>;

    /// Results for search-as-you-type; none by default
    async fn inline_query(&self, _state: &Self::State, _query: &str) -> Vec<InlineResult> {
        Vec::new()
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("handler failed in chat {chat_id} (state {state}, event {event}): {source}")]
    Handler {
        chat_id: ChatId,
        state: String,
        event: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Options for [`Context::reply_with`]
#[derive(Debug, Clone)]
pub struct ReplyOptions<S> {
    pub transition: Option<S>,
    pub format: Option<Format>,
}

impl<S> Default for ReplyOptions<S> {
    fn default() -> Self {
        Self {
            transition: None,
            format: None,
        }
    }
}

impl<S> ReplyOptions<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `state` once the reply is delivered
    pub fn transition(mut self, state: S) -> Self {
        self.transition = Some(state);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }
}

/// Keyboard handling for [`Context::edit`]
#[derive(Debug, Clone)]
pub enum KeyboardEdit<A> {
    /// Keep whatever keyboard is bound to the message
    Keep,
    Replace(InlineKeyboard<A>),
    Remove,
}

/// Handler view of the session being dispatched
pub struct Context<'a, D: Dialog> {
    dialog: &'a D,
    transport: &'a dyn ChatTransport,
    session: &'a mut Session<D::State, D::Action>,
}

impl<'a, D: Dialog> Context<'a, D> {
    pub fn chat_id(&self) -> ChatId {
        self.session.chat_id
    }

    pub fn state(&self) -> &D::State {
        &self.session.state
    }

    /// Change state without sending anything
    pub fn transition(&mut self, state: D::State) {
        debug!(chat_id = self.session.chat_id, state = ?state, "State transition");
        self.session.state = state;
    }

    /// Plain reply; state and keyboard unchanged
    pub async fn reply(&mut self, text: &str) -> Result<MessageId, TransportError> {
        self.reply_with(text, ReplyOptions::new()).await
    }

    /// Reply, rendering the destination state's buttons when transitioning.
    /// The transition is committed only if the send succeeded.
    pub async fn reply_with(
        &mut self,
        text: &str,
        options: ReplyOptions<D::State>,
    ) -> Result<MessageId, TransportError> {
        let markup = options
            .transition
            .as_ref()
            .map(|state| self.dialog.layout(state).reply_markup());

        let message_id = self
            .transport
            .send(self.session.chat_id, text, markup, options.format)
            .await?;

        if let Some(state) = options.transition {
            self.transition(state);
        }
        Ok(message_id)
    }

    /// Send a message with inline buttons and bind them to the new message.
    /// The current state is left alone.
    pub async fn reply_with_inline_keyboard(
        &mut self,
        text: &str,
        keyboard: InlineKeyboard<D::Action>,
        format: Option<Format>,
    ) -> Result<MessageId, TransportError> {
        let message_id = self
            .transport
            .send(
                self.session.chat_id,
                text,
                Some(Markup::Inline(keyboard.buttons())),
                format,
            )
            .await?;

        self.session.bind_keyboard(message_id, keyboard);
        Ok(message_id)
    }

    /// Edit a sent message's text and/or keyboard in place
    pub async fn edit(
        &mut self,
        message_id: MessageId,
        text: Option<&str>,
        keyboard: KeyboardEdit<D::Action>,
        format: Option<Format>,
    ) -> Result<(), TransportError> {
        let inline = match &keyboard {
            KeyboardEdit::Keep => self
                .session
                .pending_keyboards
                .get(&message_id)
                .map(InlineKeyboard::buttons),
            KeyboardEdit::Replace(replacement) => Some(replacement.buttons()),
            KeyboardEdit::Remove => None,
        };

        self.transport
            .edit(self.session.chat_id, message_id, text, inline, format)
            .await?;

        match keyboard {
            KeyboardEdit::Keep => {}
            KeyboardEdit::Replace(replacement) => {
                self.session.bind_keyboard(message_id, replacement);
            }
            KeyboardEdit::Remove => {
                self.session.pending_keyboards.remove(&message_id);
            }
        }
        Ok(())
    }
}

/// Resolve inbound text against a layout: command, then button label, then
/// the first matching pattern, then the default.
pub fn route_text<A: Clone>(layout: &Layout<A>, text: &str) -> (A, Input) {
    let (token, rest) = split_command(text);
    if !token.is_empty() {
        let token = command_name(token);
        if let Some((_, action)) = layout.commands.iter().find(|(t, _)| t == token) {
            return (
                action.clone(),
                Input::Command {
                    rest: rest.to_string(),
                },
            );
        }
    }

    if let Some((_, action)) = layout.buttons.iter().flatten().find(|(label, _)| label == text) {
        return (action.clone(), Input::Button);
    }

    if let Some((_, action)) = layout.patterns.iter().find(|(re, _)| re.is_match(text)) {
        return (
            action.clone(),
            Input::Pattern {
                text: text.to_string(),
            },
        );
    }

    (
        layout.default.clone(),
        Input::Text {
            text: text.to_string(),
        },
    )
}

fn split_command(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (text, ""),
    }
}

/// `/cmd@botname` -> `/cmd`
fn command_name(token: &str) -> &str {
    if token.starts_with('/') {
        token.split_once('@').map_or(token, |(name, _)| name)
    } else {
        token
    }
}

/// Routes inbound events to the dialog, one at a time per chat
pub struct Dispatcher<D: Dialog> {
    dialog: Arc<D>,
    transport: Arc<dyn ChatTransport>,
    sessions: SessionStore<D>,
}

impl<D: Dialog> Dispatcher<D> {
    pub fn new(dialog: Arc<D>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            sessions: SessionStore::new(dialog.clone()),
            dialog,
            transport,
        }
    }

    pub fn sessions(&self) -> &SessionStore<D> {
        &self.sessions
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn allow(&self, chat_id: ChatId) {
        self.sessions.allow(chat_id);
    }

    pub fn is_allowed(&self, chat_id: ChatId) -> bool {
        self.sessions.is_allowed(chat_id)
    }

    /// Current state of a chat (creates the session if needed)
    pub async fn state_of(&self, chat_id: ChatId) -> D::State {
        self.sessions.get_or_create(chat_id).lock().await.state.clone()
    }

    pub async fn on_text(&self, chat_id: ChatId, text: &str) -> Result<(), DispatchError> {
        let handle = self.sessions.get_or_create(chat_id);
        let mut session = handle.lock().await;

        let (action, input) = route_text(&self.dialog.layout(&session.state), text);
        trace!(chat_id = chat_id, action = ?action, "Text routed");

        self.invoke(&mut session, action, input, format!("text {:?}", text))
            .await
    }

    /// Inline-keyboard press. Presses on unbound messages or with unknown
    /// data are ignored.
    pub async fn on_callback(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        data: &str,
    ) -> Result<(), DispatchError> {
        let handle = self.sessions.get_or_create(chat_id);
        let mut session = handle.lock().await;

        let Some(keyboard) = session.pending_keyboards.get(&message_id) else {
            debug!(
                chat_id = chat_id,
                message_id = message_id,
                "Callback for a message without a bound keyboard, ignoring"
            );
            return Ok(());
        };
        let Some(action) = keyboard.action_for(data).cloned() else {
            debug!(
                chat_id = chat_id,
                message_id = message_id,
                data = data,
                "Unknown callback data, ignoring"
            );
            return Ok(());
        };

        let input = Input::Callback {
            message_id,
            data: data.to_string(),
        };
        let event = format!("callback {} {:?}", message_id, data);
        self.invoke(&mut session, action, input, event).await
    }

    pub async fn on_inline_query(&self, chat_id: ChatId, query: &str) -> Vec<InlineResult> {
        let handle = self.sessions.get_or_create(chat_id);
        let session = handle.lock().await;
        self.dialog.inline_query(&session.state, query).await
    }

    /// Run an action in a chat's session on behalf of the application
    pub async fn trigger(&self, chat_id: ChatId, action: D::Action) -> Result<(), DispatchError> {
        let handle = self.sessions.get_or_create(chat_id);
        let mut session = handle.lock().await;

        let event = format!("trigger {:?}", action);
        self.invoke(&mut session, action, Input::Trigger, event)
            .await
    }

    async fn invoke(
        &self,
        session: &mut Session<D::State, D::Action>,
        action: D::Action,
        input: Input,
        event: String,
    ) -> Result<(), DispatchError> {
        let chat_id = session.chat_id;
        let state = format!("{:?}", session.state);

        let mut ctx = Context {
            dialog: self.dialog.as_ref(),
            transport: self.transport.as_ref(),
            session,
        };

        self.dialog
            .handle(&mut ctx, action, input)
            .await
            .map_err(|source| DispatchError::Handler {
                chat_id,
                state,
                event,
                source,
            })
    }
}
