//! Operator conversation: presence queries, new-device alerts and the
//! device/person registration flows

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lanwatch_chat::{
    Context, Dialog, Format, InlineKey, InlineKeyboard, InlineResult, Input, KeyboardEdit, Layout,
    ReplyOptions,
};
use lanwatch_core::{Device, DeviceRegistry, HardwareId, NewDevice, Person, Store, StoreError};
use lanwatch_discovery::{
    Correlator, NewDeviceEvent, PresenceEntry, PresenceReport, PresenceView, Registration,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const INLINE_RESULT_LIMIT: usize = 20;
const HISTORY_LIMIT: usize = 50;

const BTN_CURRENT: &str = "Current";
const BTN_HISTORY: &str = "History";
const BTN_ADD_DEVICE: &str = "Add device";
const BTN_ADD_PERSON: &str = "Add person";
const BTN_CANCEL: &str = "Cancel";
const BTN_SKIP: &str = "Skip";
const BTN_NOBODY: &str = "Nobody";

const HELP_TEXT: &str = "<b>LAN Watch</b>\n\
    /current - devices seen in the last scan\n\
    /history - last sighting of every device\n\
    /people - registered people and their devices\n\
    Send a hardware address to look a device up.\n\
    Use <i>Add device</i> or <i>Add person</i> to register.";

/// Conversation states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatState {
    Main,
    AwaitHardwareId,
    AwaitDeviceName {
        hardware_id: HardwareId,
    },
    AwaitOwner {
        hardware_id: HardwareId,
        name: Option<String>,
    },
    AwaitPersonName,
}

/// Everything a chat event can resolve to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Help,
    Current,
    History,
    People,
    AddDevice,
    AddPerson,
    DeviceInfo,
    NotRecognised,
    Cancel,
    SubmitHardwareId,
    SubmitDeviceName,
    SkipDeviceName,
    ChooseOwner(u64),
    NoOwner,
    SubmitOwnerName,
    SubmitPersonName,
    NewDeviceAlert(NewDeviceEvent),
    RegisterDevice(HardwareId),
    IgnoreDevice(HardwareId),
    RefreshPresence,
}

/// Input problems answered by re-prompting in the same state
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("'{0}' is not a hardware address")]
    InvalidHardwareId(String),
    #[error("{hardware_id} is already registered as {name}")]
    AlreadyRegistered {
        hardware_id: HardwareId,
        name: String,
    },
    #[error("nobody called '{0}' is registered")]
    UnknownOwner(String),
    #[error("the name cannot be empty")]
    EmptyName,
    #[error("a person named '{0}' already exists")]
    DuplicatePerson(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Escape text for HTML-formatted messages
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// The LAN Watch operator dialog
pub struct LanWatchDialog {
    store: Arc<dyn Store>,
    /// Registrations go through the correlator so they never interleave
    /// with a scan cycle
    correlator: Arc<Correlator>,
    presence: PresenceView,
    hardware_id_pattern: Regex,
}

impl LanWatchDialog {
    pub fn new(store: Arc<dyn Store>, correlator: Arc<Correlator>) -> Result<Self> {
        let hardware_id_pattern =
            Regex::new(r"^\s*[0-9A-Fa-f]{2}(?:[:\-.]?[0-9A-Fa-f]{2}){5}\s*$")?;
        Ok(Self {
            store,
            presence: correlator.view(),
            correlator,
            hardware_id_pattern,
        })
    }

    async fn say(&self, ctx: &mut Context<'_, Self>, text: &str) -> Result<()> {
        ctx.reply_with(text, ReplyOptions::new().format(Format::Html))
            .await?;
        Ok(())
    }

    async fn go(&self, ctx: &mut Context<'_, Self>, text: &str, state: ChatState) -> Result<()> {
        ctx.reply_with(
            text,
            ReplyOptions::new().transition(state).format(Format::Html),
        )
        .await?;
        Ok(())
    }

    /// Explain a rejected input; the state does not change
    async fn reprompt(
        &self,
        ctx: &mut Context<'_, Self>,
        error: RegistrationError,
        hint: &str,
    ) -> Result<()> {
        if let RegistrationError::Store(e) = error {
            return Err(e.into());
        }
        let text = format!("{}\n{}", escape_html(&capitalize(&error.to_string())), hint);
        self.say(ctx, &text).await
    }

    fn validate_new_hardware_id(&self, raw: &str) -> Result<HardwareId, RegistrationError> {
        let hardware_id = HardwareId::parse(raw)
            .map_err(|_| RegistrationError::InvalidHardwareId(raw.trim().to_string()))?;
        if let Some(device) = self.store.find_by_hardware_id(&hardware_id)? {
            return Err(RegistrationError::AlreadyRegistered {
                hardware_id,
                name: device.display_name().to_string(),
            });
        }
        Ok(hardware_id)
    }

    async fn ask_device_name(
        &self,
        ctx: &mut Context<'_, Self>,
        hardware_id: HardwareId,
    ) -> Result<()> {
        let text = format!(
            "Name for <code>{}</code>? Press {} to leave it unnamed.",
            hardware_id, BTN_SKIP
        );
        self.go(ctx, &text, ChatState::AwaitDeviceName { hardware_id })
            .await
    }

    async fn ask_owner(
        &self,
        ctx: &mut Context<'_, Self>,
        hardware_id: HardwareId,
        name: Option<String>,
    ) -> Result<()> {
        let label = name.as_deref().unwrap_or(hardware_id.as_str());
        let text = format!(
            "Who owns <b>{}</b>? Pick a person, type a name, or press {}.",
            escape_html(label),
            BTN_NOBODY
        );
        self.go(ctx, &text, ChatState::AwaitOwner { hardware_id, name })
            .await
    }

    async fn complete_registration(
        &self,
        ctx: &mut Context<'_, Self>,
        hardware_id: HardwareId,
        name: Option<String>,
        owner: Option<u64>,
    ) -> Result<()> {
        let Registration { device, backfilled } = match self.correlator.register(NewDevice {
            hardware_id,
            name,
            owner,
        }) {
            Ok(registration) => registration,
            Err(StoreError::UnknownPerson(id)) => {
                let error = RegistrationError::UnknownOwner(format!("#{}", id));
                return self
                    .reprompt(ctx, error, "Pick a person from the keyboard.")
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        let owner = match device.owner {
            Some(id) => self.store.find_person(id)?,
            None => None,
        };
        let text = format!(
            "Registered <b>{}</b> (<code>{}</code>), owner {}.\n{} earlier sightings linked.",
            escape_html(device.display_name()),
            device.hardware_id,
            owner_label(owner.as_ref()),
            backfilled
        );
        self.go(ctx, &text, ChatState::Main).await
    }

    async fn current(&self, ctx: &mut Context<'_, Self>) -> Result<()> {
        let Some(report) = self.presence.current()? else {
            return self.say(ctx, "No scan has completed yet.").await;
        };
        let keyboard = InlineKeyboard::new().row([InlineKey::new(
            "Refresh",
            "refresh",
            Action::RefreshPresence,
        )]);
        ctx.reply_with_inline_keyboard(&render_report(&report), keyboard, Some(Format::Html))
            .await?;
        Ok(())
    }

    async fn refresh(&self, ctx: &mut Context<'_, Self>, input: Input) -> Result<()> {
        let Input::Callback { message_id, .. } = input else {
            return self.current(ctx).await;
        };
        let body = match self.presence.current()? {
            Some(report) => render_report(&report),
            None => "No scan has completed yet.\n".to_string(),
        };
        // Edits must change the text, so stamp the refresh time
        let text = format!("{}\n<i>Updated {}</i>", body, Utc::now().format("%H:%M:%S"));
        ctx.edit(message_id, Some(&text), KeyboardEdit::Keep, Some(Format::Html))
            .await?;
        Ok(())
    }

    async fn history(&self, ctx: &mut Context<'_, Self>) -> Result<()> {
        let entries = self.presence.last_seen()?;
        if entries.is_empty() {
            return self.say(ctx, "Nothing has been seen yet.").await;
        }

        let mut text = String::from("<b>Last seen</b>\n");
        for entry in entries.iter().take(HISTORY_LIMIT) {
            text.push_str(&format!(
                "{} {}, {}\n",
                entry_label(entry),
                escape_html(&entry.result.network_address),
                format_time(entry.result.timestamp)
            ));
        }
        if entries.len() > HISTORY_LIMIT {
            text.push_str(&format!("... and {} more\n", entries.len() - HISTORY_LIMIT));
        }
        self.say(ctx, &text).await
    }

    async fn people(&self, ctx: &mut Context<'_, Self>) -> Result<()> {
        let people = self.store.list_people()?;
        if people.is_empty() {
            return self.say(ctx, "Nobody is registered yet.").await;
        }

        let mut devices: HashMap<u64, Vec<Device>> = HashMap::new();
        for device in self.store.list_all()? {
            if let Some(owner) = device.owner {
                devices.entry(owner).or_default().push(device);
            }
        }

        let mut text = String::from("<b>People</b>\n");
        for person in &people {
            let owned: Vec<String> = devices
                .get(&person.id)
                .map(|list| list.iter().map(|d| escape_html(d.display_name())).collect())
                .unwrap_or_default();
            let owned = if owned.is_empty() {
                "no devices".to_string()
            } else {
                owned.join(", ")
            };
            text.push_str(&format!("{}: {}\n", escape_html(&person.name), owned));
        }
        self.say(ctx, &text).await
    }

    async fn device_info(&self, ctx: &mut Context<'_, Self>, raw: &str) -> Result<()> {
        let hardware_id = match HardwareId::parse(raw) {
            Ok(id) => id,
            Err(_) => {
                let error = RegistrationError::InvalidHardwareId(raw.trim().to_string());
                return self.reprompt(ctx, error, "").await;
            }
        };

        let last_seen = self
            .presence
            .last_seen()?
            .into_iter()
            .find(|e| e.result.hardware_id == hardware_id);
        let seen = match &last_seen {
            Some(entry) => format!(
                "Last seen {} at {}.",
                format_time(entry.result.timestamp),
                escape_html(&entry.result.network_address)
            ),
            None => "Never seen.".to_string(),
        };

        match self.store.find_by_hardware_id(&hardware_id)? {
            Some(device) => {
                let owner = match device.owner {
                    Some(id) => self.store.find_person(id)?,
                    None => None,
                };
                let text = format!(
                    "<b>{}</b> (<code>{}</code>)\nOwner: {}\n{}",
                    escape_html(device.display_name()),
                    hardware_id,
                    owner_label(owner.as_ref()),
                    seen
                );
                self.say(ctx, &text).await
            }
            None => {
                let text = format!("<code>{}</code> is not registered.\n{}", hardware_id, seen);
                let keyboard = InlineKeyboard::new().row([InlineKey::new(
                    "Register",
                    "register",
                    Action::RegisterDevice(hardware_id),
                )]);
                ctx.reply_with_inline_keyboard(&text, keyboard, Some(Format::Html))
                    .await?;
                Ok(())
            }
        }
    }

    async fn new_device_alert(
        &self,
        ctx: &mut Context<'_, Self>,
        event: NewDeviceEvent,
    ) -> Result<()> {
        let text = format!(
            "New device {} at {}",
            code(&event.hardware_id),
            escape_html(&event.network_address)
        );
        let keyboard = InlineKeyboard::new().row([
            InlineKey::new(
                "Register",
                "register",
                Action::RegisterDevice(event.hardware_id.clone()),
            ),
            InlineKey::new("Ignore", "ignore", Action::IgnoreDevice(event.hardware_id)),
        ]);
        ctx.reply_with_inline_keyboard(&text, keyboard, Some(Format::Html))
            .await?;
        Ok(())
    }

    async fn register_from_callback(
        &self,
        ctx: &mut Context<'_, Self>,
        hardware_id: HardwareId,
        input: Input,
    ) -> Result<()> {
        if let Input::Callback { message_id, .. } = input {
            let text = format!("Registering {}", code(&hardware_id));
            ctx.edit(message_id, Some(&text), KeyboardEdit::Remove, Some(Format::Html))
                .await?;
        }

        if let Some(device) = self.store.find_by_hardware_id(&hardware_id)? {
            let error = RegistrationError::AlreadyRegistered {
                hardware_id,
                name: device.display_name().to_string(),
            };
            return self.reprompt(ctx, error, "").await;
        }
        self.ask_device_name(ctx, hardware_id).await
    }

    fn search(&self, query: &str) -> Result<Vec<InlineResult>, StoreError> {
        let query = query.trim().to_lowercase();
        let people: HashMap<u64, Person> = self
            .store
            .list_people()?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut results: Vec<InlineResult> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|d| {
                d.hardware_id.as_str().contains(&query)
                    || d.name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&query))
            })
            .map(|d| {
                let owner = d.owner.and_then(|id| people.get(&id));
                InlineResult {
                    id: format!("device-{}", d.id),
                    title: d.display_name().to_string(),
                    description: Some(format!(
                        "{}, owner {}",
                        d.hardware_id,
                        owner.map(|p| p.name.as_str()).unwrap_or("nobody")
                    )),
                    message_text: format!(
                        "<b>{}</b> (<code>{}</code>), owner {}",
                        escape_html(d.display_name()),
                        d.hardware_id,
                        owner_label(owner)
                    ),
                }
            })
            .collect();

        let mut matching_people: Vec<&Person> = people
            .values()
            .filter(|p| p.name.to_lowercase().contains(&query))
            .collect();
        matching_people.sort_by_key(|p| p.id);
        results.extend(matching_people.into_iter().map(|p| InlineResult {
            id: format!("person-{}", p.id),
            title: p.name.clone(),
            description: Some("person".to_string()),
            message_text: format!("<b>{}</b>", escape_html(&p.name)),
        }));

        results.truncate(INLINE_RESULT_LIMIT);
        Ok(results)
    }
}

#[async_trait]
impl Dialog for LanWatchDialog {
    type State = ChatState;
    type Action = Action;

    fn initial_state(&self) -> ChatState {
        ChatState::Main
    }

    fn layout(&self, state: &ChatState) -> Layout<Action> {
        let layout = match state {
            ChatState::Main => {
                return Layout::new(Action::NotRecognised)
                    .command("/start", Action::Start)
                    .command("/help", Action::Help)
                    .command("/current", Action::Current)
                    .command("/history", Action::History)
                    .command("/people", Action::People)
                    .row([(BTN_CURRENT, Action::Current), (BTN_HISTORY, Action::History)])
                    .row([
                        (BTN_ADD_DEVICE, Action::AddDevice),
                        (BTN_ADD_PERSON, Action::AddPerson),
                    ])
                    .pattern(self.hardware_id_pattern.clone(), Action::DeviceInfo)
            }
            ChatState::AwaitHardwareId => {
                Layout::new(Action::SubmitHardwareId).row([(BTN_CANCEL, Action::Cancel)])
            }
            ChatState::AwaitDeviceName { .. } => Layout::new(Action::SubmitDeviceName)
                .row([(BTN_SKIP, Action::SkipDeviceName), (BTN_CANCEL, Action::Cancel)]),
            ChatState::AwaitOwner { .. } => {
                let people = self.store.list_people().unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to list people for the owner keyboard");
                    Vec::new()
                });
                let mut layout = Layout::new(Action::SubmitOwnerName);
                for chunk in people.chunks(3) {
                    layout = layout.row(
                        chunk
                            .iter()
                            .map(|p| (p.name.clone(), Action::ChooseOwner(p.id))),
                    );
                }
                layout.row([(BTN_NOBODY, Action::NoOwner), (BTN_CANCEL, Action::Cancel)])
            }
            ChatState::AwaitPersonName => {
                Layout::new(Action::SubmitPersonName).row([(BTN_CANCEL, Action::Cancel)])
            }
        };

        layout
            .command("/start", Action::Start)
            .command("/cancel", Action::Cancel)
    }

    async fn handle(
        &self,
        ctx: &mut Context<'_, Self>,
        action: Action,
        input: Input,
    ) -> Result<()> {
        let text = input.text().unwrap_or_default().trim().to_string();

        match action {
            Action::Start => {
                self.go(
                    ctx,
                    "<b>LAN Watch</b> is watching the network. Use the buttons below or /help.",
                    ChatState::Main,
                )
                .await
            }
            Action::Help => self.say(ctx, HELP_TEXT).await,
            Action::Current => self.current(ctx).await,
            Action::RefreshPresence => self.refresh(ctx, input).await,
            Action::History => self.history(ctx).await,
            Action::People => self.people(ctx).await,
            Action::DeviceInfo => self.device_info(ctx, &text).await,
            Action::NotRecognised => {
                self.say(ctx, "Not recognised. Use the buttons below or /help.")
                    .await
            }
            Action::Cancel => self.go(ctx, "Cancelled.", ChatState::Main).await,

            Action::AddDevice => {
                self.go(
                    ctx,
                    "Send the hardware address of the device, e.g. <code>aa:bb:cc:dd:ee:ff</code>.",
                    ChatState::AwaitHardwareId,
                )
                .await
            }
            Action::SubmitHardwareId => match self.validate_new_hardware_id(&text) {
                Ok(hardware_id) => self.ask_device_name(ctx, hardware_id).await,
                Err(e) => {
                    self.reprompt(ctx, e, "Send a hardware address or press Cancel.")
                        .await
                }
            },
            Action::SubmitDeviceName | Action::SkipDeviceName => {
                let ChatState::AwaitDeviceName { hardware_id } = ctx.state().clone() else {
                    return self.go(ctx, "Start again with Add device.", ChatState::Main).await;
                };
                if action == Action::SkipDeviceName {
                    return self.ask_owner(ctx, hardware_id, None).await;
                }
                if text.is_empty() {
                    return self
                        .reprompt(ctx, RegistrationError::EmptyName, "Send a name or press Skip.")
                        .await;
                }
                self.ask_owner(ctx, hardware_id, Some(text)).await
            }
            Action::ChooseOwner(_) | Action::NoOwner | Action::SubmitOwnerName => {
                let ChatState::AwaitOwner { hardware_id, name } = ctx.state().clone() else {
                    return self.go(ctx, "Start again with Add device.", ChatState::Main).await;
                };
                let owner = match action {
                    Action::ChooseOwner(id) => Some(id),
                    Action::NoOwner => None,
                    _ => match self.store.find_person_by_name(&text)? {
                        Some(person) => Some(person.id),
                        None => {
                            let error = RegistrationError::UnknownOwner(text);
                            return self
                                .reprompt(ctx, error, "Pick a person, add them first, or press Nobody.")
                                .await;
                        }
                    },
                };
                self.complete_registration(ctx, hardware_id, name, owner)
                    .await
            }

            Action::AddPerson => {
                self.go(ctx, "Send the name of the person.", ChatState::AwaitPersonName)
                    .await
            }
            Action::SubmitPersonName => {
                if text.is_empty() {
                    return self
                        .reprompt(ctx, RegistrationError::EmptyName, "Send a name or press Cancel.")
                        .await;
                }
                match self.store.add_person(&text) {
                    Ok(person) => {
                        info!(person = %person.name, id = person.id, "Person added");
                        let reply = format!("Added <b>{}</b>.", escape_html(&person.name));
                        self.go(ctx, &reply, ChatState::Main).await
                    }
                    Err(StoreError::DuplicatePerson(name)) => {
                        self.reprompt(
                            ctx,
                            RegistrationError::DuplicatePerson(name),
                            "Send another name or press Cancel.",
                        )
                        .await
                    }
                    Err(e) => Err(e.into()),
                }
            }

            Action::NewDeviceAlert(event) => self.new_device_alert(ctx, event).await,
            Action::RegisterDevice(hardware_id) => {
                self.register_from_callback(ctx, hardware_id, input).await
            }
            Action::IgnoreDevice(hardware_id) => {
                if let Input::Callback { message_id, .. } = input {
                    let text = format!("Ignored {}", code(&hardware_id));
                    ctx.edit(message_id, Some(&text), KeyboardEdit::Remove, Some(Format::Html))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn inline_query(&self, state: &ChatState, query: &str) -> Vec<InlineResult> {
        if *state != ChatState::Main {
            return Vec::new();
        }
        self.search(query).unwrap_or_else(|e| {
            warn!(error = %e, "Inline search failed");
            Vec::new()
        })
    }
}

/// Presence report as HTML
pub fn render_report(report: &PresenceReport) -> String {
    let mut text = format!("<b>Present at {}</b>\n", format_time(report.timestamp));

    let registered: Vec<&PresenceEntry> = report.registered().collect();
    if !registered.is_empty() {
        text.push_str("\nDevices:\n");
        for entry in registered {
            let name = entry
                .device
                .as_ref()
                .map(|d| escape_html(d.display_name()))
                .unwrap_or_default();
            text.push_str(&format!("{}: {}\n", owner_label(entry.owner.as_ref()), name));
        }
    }

    let unknown: Vec<&PresenceEntry> = report.unknown().collect();
    if !unknown.is_empty() {
        text.push_str("\nUnknown devices:\n<code>");
        for entry in unknown {
            text.push_str(&format!(
                "{} {}\n",
                escape_html(entry.result.hardware_id.as_str()),
                escape_html(&entry.result.network_address)
            ));
        }
        text.push_str("</code>");
    }

    if report.entries.is_empty() {
        text.push_str("\nNothing answered.\n");
    }
    text
}

fn owner_label(owner: Option<&Person>) -> String {
    match owner {
        Some(person) => escape_html(&person.name),
        None => "<i>nobody</i>".to_string(),
    }
}

fn code(hardware_id: &HardwareId) -> String {
    format!("<code>{}</code>", escape_html(hardware_id.as_str()))
}

fn entry_label(entry: &PresenceEntry) -> String {
    match &entry.device {
        Some(device) => format!("<b>{}</b>", escape_html(device.display_name())),
        None => code(&entry.result.hardware_id),
    }
}

fn format_time(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
