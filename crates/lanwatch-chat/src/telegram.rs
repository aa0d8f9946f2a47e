//! Telegram Bot API transport
//!
//! Outgoing calls go through the JSON Bot API. Inbound events are received by
//! long polling `getUpdates`. Updates are queued per chat and each chat has a
//! single worker task, so one chat's events are handled in arrival order while
//! different chats proceed concurrently.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dialog, DispatchError, Dispatcher};
use crate::transport::{
    ChatId, ChatTransport, Format, InlineButton, InlineResult, Markup, MessageId, TransportError,
};

pub const API_BASE: &str = "https://api.telegram.org";

/// Reply sent to chats that are not on the allow-list
pub const ACCESS_DENIED: &str = "Access denied";

const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
    pub inline_query: Option<InlineQuery>,
}

/// Bot API client. The token is part of every URL, so this type is
/// deliberately not `Debug`.
pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    poll_timeout: Duration,
}

impl TelegramTransport {
    pub fn new(token: &str, poll_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", API_BASE, token),
            poll_timeout,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.without_url()))?;

        let response: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Http(e.without_url()))?;

        if !response.ok {
            return Err(TransportError::Api {
                code: response.error_code,
                description: response.description.unwrap_or_default(),
            });
        }
        response
            .result
            .ok_or_else(|| TransportError::InvalidResponse(format!("{} returned no result", method)))
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message", "callback_query", "inline_query"],
            }),
        )
        .await
    }

    /// Receive updates forever, handing each to its chat's queue
    pub async fn run_polling<D: Dialog>(self: Arc<Self>, dispatcher: Arc<Dispatcher<D>>) {
        info!(
            poll_timeout_secs = self.poll_timeout.as_secs(),
            "Telegram polling started"
        );
        let mut queues = UpdateQueues::new(dispatcher);
        let mut offset = 0;

        loop {
            match self.get_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        queues.push(update);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to poll Telegram updates, retrying");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        markup: Option<Markup>,
        format: Option<Format>,
    ) -> Result<MessageId, TransportError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = &markup {
            body["reply_markup"] = markup_json(markup);
        }
        if let Some(format) = format {
            body["parse_mode"] = json!(parse_mode(format));
        }

        let message: Message = self.call("sendMessage", body).await?;
        Ok(message.message_id)
    }

    async fn edit(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        inline: Option<Vec<Vec<InlineButton>>>,
        format: Option<Format>,
    ) -> Result<(), TransportError> {
        let keyboard = inline_keyboard_json(inline.as_deref().unwrap_or_default());
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id });

        let method = match text {
            Some(text) => {
                body["text"] = json!(text);
                if inline.is_some() {
                    body["reply_markup"] = keyboard;
                }
                if let Some(format) = format {
                    body["parse_mode"] = json!(parse_mode(format));
                }
                "editMessageText"
            }
            None => {
                body["reply_markup"] = keyboard;
                "editMessageReplyMarkup"
            }
        };

        // Result is the edited message or `true`
        let _: Value = self.call(method, body).await?;
        Ok(())
    }

    async fn answer_inline(
        &self,
        query_id: &str,
        results: Vec<InlineResult>,
    ) -> Result<(), TransportError> {
        let results: Vec<Value> = results.iter().map(inline_result_json).collect();
        let _: Value = self
            .call(
                "answerInlineQuery",
                json!({
                    "inline_query_id": query_id,
                    "results": results,
                    "cache_time": 0,
                    "is_personal": true,
                }),
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        let _: Value = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }
}

/// Per-chat update queues, each drained by one worker task
pub struct UpdateQueues<D: Dialog> {
    dispatcher: Arc<Dispatcher<D>>,
    workers: HashMap<ChatId, mpsc::UnboundedSender<Update>>,
}

impl<D: Dialog> UpdateQueues<D> {
    pub fn new(dispatcher: Arc<Dispatcher<D>>) -> Self {
        Self {
            dispatcher,
            workers: HashMap::new(),
        }
    }

    /// Queue an update behind earlier updates from the same chat
    pub fn push(&mut self, update: Update) {
        let Some(chat_id) = update_chat(&update) else {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { handle_update(&dispatcher, update).await });
            return;
        };

        let update = match self.workers.get(&chat_id) {
            Some(queue) => match queue.send(update) {
                Ok(()) => return,
                // Worker is gone (a handler panicked); start a fresh one
                Err(mpsc::error::SendError(update)) => {
                    warn!(chat_id = chat_id, "Chat worker stopped, restarting");
                    update
                }
            },
            None => update,
        };

        let queue = self.spawn_worker(chat_id);
        if queue.send(update).is_err() {
            error!(chat_id = chat_id, "Failed to queue update for a new chat worker");
        }
        self.workers.insert(chat_id, queue);
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&self, chat_id: ChatId) -> mpsc::UnboundedSender<Update> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = self.dispatcher.clone();
        debug!(chat_id = chat_id, "Starting chat worker");
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                handle_update(&dispatcher, update).await;
            }
        });
        tx
    }
}

/// Chat whose session an update belongs to
fn update_chat(update: &Update) -> Option<ChatId> {
    if let Some(message) = &update.message {
        return Some(message.chat.id);
    }
    if let Some(query) = &update.callback_query {
        return Some(
            query
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .unwrap_or(query.from.id),
        );
    }
    update.inline_query.as_ref().map(|query| query.from.id)
}

/// Route one update. Rejects chats outside the allow-list and logs handler
/// failures; never panics the polling loop.
pub async fn handle_update<D: Dialog>(dispatcher: &Dispatcher<D>, update: Update) {
    let transport = dispatcher.transport();

    if let Some(message) = update.message {
        let chat_id = message.chat.id;
        let Some(text) = message.text else {
            debug!(chat_id = chat_id, "Ignoring non-text message");
            return;
        };
        if !dispatcher.is_allowed(chat_id) {
            deny(dispatcher, chat_id).await;
            return;
        }
        log_dispatch(dispatcher.on_text(chat_id, &text).await);
    } else if let Some(query) = update.callback_query {
        if let Err(e) = transport.answer_callback(&query.id).await {
            warn!(error = %e, "Failed to acknowledge callback");
        }
        let Some(message) = query.message else {
            debug!(user = query.from.id, "Callback without a message, ignoring");
            return;
        };
        let chat_id = message.chat.id;
        if !dispatcher.is_allowed(chat_id) {
            deny(dispatcher, chat_id).await;
            return;
        }
        let data = query.data.unwrap_or_default();
        log_dispatch(
            dispatcher
                .on_callback(chat_id, message.message_id, &data)
                .await,
        );
    } else if let Some(query) = update.inline_query {
        // Inline queries come from a user; their private chat id is the user id
        let chat_id = query.from.id;
        let results = if dispatcher.is_allowed(chat_id) {
            dispatcher.on_inline_query(chat_id, &query.query).await
        } else {
            warn!(chat_id = chat_id, "Inline query from a chat that is not allowed");
            Vec::new()
        };
        if let Err(e) = transport.answer_inline(&query.id, results).await {
            warn!(chat_id = chat_id, error = %e, "Failed to answer inline query");
        }
    } else {
        debug!(update_id = update.update_id, "Ignoring unsupported update");
    }
}

async fn deny<D: Dialog>(dispatcher: &Dispatcher<D>, chat_id: ChatId) {
    warn!(chat_id = chat_id, "Access denied");
    if let Err(e) = dispatcher
        .transport()
        .send(chat_id, ACCESS_DENIED, None, None)
        .await
    {
        warn!(chat_id = chat_id, error = %e, "Failed to send access denied reply");
    }
}

fn log_dispatch(result: Result<(), DispatchError>) {
    if let Err(DispatchError::Handler {
        chat_id,
        state,
        event,
        source,
    }) = result
    {
        error!(
            chat_id = chat_id,
            state = %state,
            event = %event,
            error = ?source,
            "Chat handler failed"
        );
    }
}

fn parse_mode(format: Format) -> &'static str {
    match format {
        Format::Html => "HTML",
        Format::MarkdownV2 => "MarkdownV2",
    }
}

fn inline_keyboard_json(rows: &[Vec<InlineButton>]) -> Value {
    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn markup_json(markup: &Markup) -> Value {
    match markup {
        Markup::Keyboard(rows) => {
            let rows: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                .collect();
            json!({ "keyboard": rows, "resize_keyboard": true })
        }
        Markup::RemoveKeyboard => json!({ "remove_keyboard": true }),
        Markup::Inline(rows) => inline_keyboard_json(rows),
    }
}

fn inline_result_json(result: &InlineResult) -> Value {
    let mut value = json!({
        "type": "article",
        "id": result.id,
        "title": result.title,
        "input_message_content": {
            "message_text": result.message_text,
            "parse_mode": "HTML",
        },
    });
    if let Some(description) = &result.description {
        value["description"] = json!(description);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Context, Input};
    use crate::keyboard::{InlineKey, InlineKeyboard, Layout};
    use crate::testing::{Outgoing, RecordingTransport};

    struct Echo;

    #[async_trait]
    impl Dialog for Echo {
        type State = ();
        type Action = bool;

        fn initial_state(&self) {}

        fn layout(&self, _state: &()) -> Layout<bool> {
            Layout::new(false).command("/fail", true)
        }

        async fn handle(
            &self,
            ctx: &mut Context<'_, Self>,
            fail: bool,
            input: Input,
        ) -> anyhow::Result<()> {
            if fail {
                anyhow::bail!("requested failure");
            }
            if let Input::Text { text } = input {
                if text.starts_with("slow") {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                let keyboard = InlineKeyboard::new().row([InlineKey::new("Again", "again", false)]);
                ctx.reply_with_inline_keyboard(&text, keyboard, None).await?;
            }
            Ok(())
        }

        async fn inline_query(&self, _state: &(), query: &str) -> Vec<InlineResult> {
            vec![InlineResult {
                id: "q".to_string(),
                title: query.to_string(),
                description: None,
                message_text: query.to_string(),
            }]
        }
    }

    fn update(json: Value) -> Update {
        serde_json::from_value(json).unwrap()
    }

    fn text_update(chat_id: i64, text: &str) -> Update {
        update(json!({
            "update_id": 1,
            "message": { "message_id": 10, "chat": { "id": chat_id, "type": "private" }, "text": text }
        }))
    }

    fn setup() -> (Arc<RecordingTransport>, Dispatcher<Echo>) {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(Arc::new(Echo), transport.clone());
        dispatcher.allow(100);
        (transport, dispatcher)
    }

    #[tokio::test]
    async fn test_unknown_chat_is_denied_before_any_session() {
        let (transport, dispatcher) = setup();

        handle_update(&dispatcher, text_update(666, "hello")).await;

        assert_eq!(transport.texts(), vec![ACCESS_DENIED.to_string()]);
        assert!(dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_chat_is_dispatched() {
        let (transport, dispatcher) = setup();

        handle_update(&dispatcher, text_update(100, "hello")).await;

        assert_eq!(transport.texts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained() {
        let (transport, dispatcher) = setup();

        handle_update(&dispatcher, text_update(100, "/fail")).await;
        handle_update(&dispatcher, text_update(100, "still here")).await;

        assert_eq!(transport.texts(), vec!["still here".to_string()]);
    }

    #[tokio::test]
    async fn test_callbacks_are_always_acknowledged() {
        let (transport, dispatcher) = setup();
        handle_update(&dispatcher, text_update(100, "hello")).await;

        let press = |chat_id: i64, message_id: i64| {
            update(json!({
                "update_id": 2,
                "callback_query": {
                    "id": format!("cb-{}", chat_id),
                    "from": { "id": chat_id },
                    "message": { "message_id": message_id, "chat": { "id": chat_id } },
                    "data": "again"
                }
            }))
        };

        handle_update(&dispatcher, press(100, 1)).await;
        handle_update(&dispatcher, press(666, 1)).await;

        let outgoing = transport.outgoing();
        assert!(outgoing.contains(&Outgoing::CallbackAnswer {
            callback_id: "cb-100".to_string()
        }));
        assert!(outgoing.contains(&Outgoing::CallbackAnswer {
            callback_id: "cb-666".to_string()
        }));
        assert_eq!(transport.texts().last().map(String::as_str), Some(ACCESS_DENIED));
    }

    #[tokio::test]
    async fn test_inline_query_results_forwarded() {
        let (transport, dispatcher) = setup();

        handle_update(
            &dispatcher,
            update(json!({
                "update_id": 3,
                "inline_query": { "id": "iq", "from": { "id": 100 }, "query": "lap", "offset": "" }
            })),
        )
        .await;

        match transport.outgoing().last() {
            Some(Outgoing::InlineAnswer { query_id, results }) => {
                assert_eq!(query_id, "iq");
                assert_eq!(results[0].title, "lap");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_one_chat_is_handled_in_arrival_order() {
        let (transport, dispatcher) = setup();
        dispatcher.allow(200);
        let mut queues = UpdateQueues::new(Arc::new(dispatcher));

        queues.push(text_update(100, "slow first"));
        queues.push(text_update(100, "second"));
        queues.push(text_update(200, "other chat"));
        queues.push(text_update(100, "third"));

        for _ in 0..100 {
            if transport.texts().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let texts = transport.texts();
        let chat_100: Vec<&str> = texts
            .iter()
            .map(String::as_str)
            .filter(|t| *t != "other chat")
            .collect();
        assert_eq!(chat_100, vec!["slow first", "second", "third"]);
        // The slow handler in chat 100 does not hold up chat 200
        assert_eq!(texts[0], "other chat");
        assert_eq!(queues.workers(), 2);
    }

    #[test]
    fn test_update_chat_keys() {
        assert_eq!(update_chat(&text_update(7, "hi")), Some(7));
        let inline = update(json!({
            "update_id": 4,
            "inline_query": { "id": "iq", "from": { "id": 9 }, "query": "" }
        }));
        assert_eq!(update_chat(&inline), Some(9));
        assert_eq!(update_chat(&update(json!({ "update_id": 5 }))), None);
    }

    #[test]
    fn test_markup_json() {
        let keyboard = markup_json(&Markup::Keyboard(vec![vec!["Current".to_string()]]));
        assert_eq!(keyboard["keyboard"][0][0]["text"], "Current");
        assert_eq!(keyboard["resize_keyboard"], true);

        let inline = markup_json(&Markup::Inline(vec![vec![InlineButton {
            text: "Register".to_string(),
            callback_data: "register".to_string(),
        }]]));
        assert_eq!(inline["inline_keyboard"][0][0]["callback_data"], "register");

        assert_eq!(markup_json(&Markup::RemoveKeyboard)["remove_keyboard"], true);
    }

    #[test]
    fn test_api_error_response() {
        let response: ApiResponse<Value> = serde_json::from_str(
            r#"{"ok": false, "error_code": 403, "description": "Forbidden: bot was blocked by the user"}"#,
        )
        .unwrap();
        assert!(!response.ok);
        assert_eq!(response.error_code, Some(403));
        assert!(response.result.is_none());
    }
}
