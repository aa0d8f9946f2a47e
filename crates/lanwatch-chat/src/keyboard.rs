//! State layouts and inline keyboards

use regex::Regex;

use crate::transport::{InlineButton, Markup};

/// Input bindings of one conversational state.
///
/// Text is matched against commands, then button labels, then patterns in
/// registration order, and finally falls through to `default`.
#[derive(Debug, Clone)]
pub struct Layout<A> {
    pub buttons: Vec<Vec<(String, A)>>,
    pub commands: Vec<(String, A)>,
    pub patterns: Vec<(Regex, A)>,
    pub default: A,
}

impl<A> Layout<A> {
    pub fn new(default: A) -> Self {
        Self {
            buttons: Vec::new(),
            commands: Vec::new(),
            patterns: Vec::new(),
            default,
        }
    }

    /// Bind a command token such as `/start`
    pub fn command(mut self, token: impl Into<String>, action: A) -> Self {
        self.commands.push((token.into(), action));
        self
    }

    /// Append a row of reply-keyboard buttons
    pub fn row<L: Into<String>>(mut self, buttons: impl IntoIterator<Item = (L, A)>) -> Self {
        let row: Vec<(String, A)> = buttons
            .into_iter()
            .map(|(label, action)| (label.into(), action))
            .collect();
        if !row.is_empty() {
            self.buttons.push(row);
        }
        self
    }

    pub fn pattern(mut self, pattern: Regex, action: A) -> Self {
        self.patterns.push((pattern, action));
        self
    }

    /// Reply keyboard shown while this state is current
    pub fn reply_markup(&self) -> Markup {
        if self.buttons.is_empty() {
            return Markup::RemoveKeyboard;
        }
        Markup::Keyboard(
            self.buttons
                .iter()
                .map(|row| row.iter().map(|(label, _)| label.clone()).collect())
                .collect(),
        )
    }
}

/// One inline button bound to an action
#[derive(Debug, Clone)]
pub struct InlineKey<A> {
    pub label: String,
    pub data: String,
    pub action: A,
}

impl<A> InlineKey<A> {
    pub fn new(label: impl Into<String>, data: impl Into<String>, action: A) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            action,
        }
    }
}

/// Inline keyboard whose buttons resolve to actions when pressed
#[derive(Debug, Clone)]
pub struct InlineKeyboard<A> {
    rows: Vec<Vec<InlineKey<A>>>,
}

impl<A> Default for InlineKeyboard<A> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<A> InlineKeyboard<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, keys: impl IntoIterator<Item = InlineKey<A>>) -> Self {
        let row: Vec<InlineKey<A>> = keys.into_iter().collect();
        if !row.is_empty() {
            self.rows.push(row);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Action bound to the given callback data
    pub fn action_for(&self, data: &str) -> Option<&A> {
        self.rows
            .iter()
            .flatten()
            .find(|key| key.data == data)
            .map(|key| &key.action)
    }

    /// Wire representation of the buttons
    pub fn buttons(&self) -> Vec<Vec<InlineButton>> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|key| InlineButton {
                        text: key.label.clone(),
                        callback_data: key.data.clone(),
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Act {
        Yes,
        No,
        Other,
    }

    #[test]
    fn test_reply_markup_lists_labels() {
        let layout = Layout::new(Act::Other)
            .row([("Yes", Act::Yes), ("No", Act::No)])
            .row(Vec::<(&str, Act)>::new());
        assert_eq!(
            layout.reply_markup(),
            Markup::Keyboard(vec![vec!["Yes".to_string(), "No".to_string()]])
        );
        assert_eq!(Layout::new(Act::Other).reply_markup(), Markup::RemoveKeyboard);
    }

    #[test]
    fn test_inline_keyboard_resolves_data() {
        let keyboard = InlineKeyboard::new()
            .row([InlineKey::new("Yes", "y", Act::Yes), InlineKey::new("No", "n", Act::No)]);

        assert_eq!(keyboard.action_for("n"), Some(&Act::No));
        assert_eq!(keyboard.action_for("maybe"), None);
        assert_eq!(keyboard.buttons()[0][0].callback_data, "y");
    }
}
