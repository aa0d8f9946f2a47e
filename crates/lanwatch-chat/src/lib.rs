//! LAN Watch Chat - Conversational dispatch over a messenger
//!
//! This crate provides:
//! - A per-session finite-state dispatch engine generic over a [`Dialog`]
//! - Reply keyboards, inline keyboards and their message bindings
//! - The chat transport boundary and a Telegram Bot API implementation
//!
//! The `testing` feature exposes `RecordingTransport`, an in-process transport
//! for exercising dialogs without a messenger.

pub mod dispatch;
pub mod keyboard;
pub mod session;
pub mod telegram;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use dispatch::{
    route_text, Context, Dialog, DispatchError, Dispatcher, Input, KeyboardEdit, ReplyOptions,
};
pub use keyboard::{InlineKey, InlineKeyboard, Layout};
pub use session::{Session, SessionStore};
pub use telegram::{TelegramTransport, UpdateQueues, ACCESS_DENIED};
pub use transport::{
    ChatId, ChatTransport, Format, InlineButton, InlineResult, Markup, MessageId, TransportError,
};
