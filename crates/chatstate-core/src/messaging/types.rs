use crate::domain::{ChatId, ChatKind, MessageId, UserId};

/// Platform-agnostic inbound update.
///
/// A single update normally carries exactly one payload; the router still
/// treats the fields independently (see `Engine::dispatch`).
#[derive(Clone, Debug, Default)]
pub struct Update {
    pub id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
    pub inline_query: Option<InlineQuery>,
}

impl Update {
    pub fn message(id: i64, message: Message) -> Self {
        Self {
            id,
            message: Some(message),
            ..Self::default()
        }
    }

    pub fn callback_query(id: i64, query: CallbackQuery) -> Self {
        Self {
            id,
            callback_query: Some(query),
            ..Self::default()
        }
    }

    pub fn inline_query(id: i64, query: InlineQuery) -> Self {
        Self {
            id,
            inline_query: Some(query),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub username: Option<String>,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Chat {
    /// Username for private chats, title for everything else.
    pub fn display_name(&self) -> Option<String> {
        match self.kind {
            ChatKind::Private => self.username.clone(),
            _ => self.title.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    BotCommand,
    Mention,
    Hashtag,
    Url,
    Other,
}

/// A formatting entity. Offsets and lengths are in UTF-16 code units, as the
/// platform reports them.
#[derive(Clone, Debug)]
pub struct MessageEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Document,
    Photo,
    Video,
}

#[derive(Clone, Debug)]
pub enum Media {
    Document {
        file_id: String,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
    /// Largest available size.
    Photo { file_id: String },
    Video { file_id: String },
}

impl Media {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Document { .. } => MediaKind::Document,
            Self::Photo { .. } => MediaKind::Photo,
            Self::Video { .. } => MediaKind::Video,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub id: MessageId,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub entities: Vec<MessageEntity>,
    pub new_chat_members: Vec<User>,
    pub left_chat_member: Option<User>,
    pub media: Option<Media>,
}

impl Message {
    /// Text covered by `entity`, or `None` when the offsets fall outside the text.
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<String> {
        let text = self.text.as_deref()?;
        let units: Vec<u16> = text.encode_utf16().collect();
        let end = entity.offset.checked_add(entity.length)?;
        let slice = units.get(entity.offset..end)?;
        String::from_utf16(slice).ok()
    }

    /// Bot-command tokens in order of appearance, e.g. `/help@mybot`.
    pub fn command_tokens(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::BotCommand)
            .filter_map(|e| self.entity_text(e))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    /// Message the pressed button belongs to; absent for inline-mode messages.
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    pub query: String,
    pub offset: String,
}

/// Application event fanned out to sessions by `Engine::broadcast_event`.
#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    MarkdownV2,
}

/// File to send: an id the platform already knows, or a URL it should fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileRef {
    Id(String),
    Url(String),
}

/// Inline keyboard (buttons) attached to an outbound message.
#[derive(Clone, Debug)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    /// One button per row; callback data is `{prefix}:{index}`.
    pub fn one_per_row(prefix: &str, options: &[String], max_label_len: usize) -> Self {
        let buttons = options
            .iter()
            .enumerate()
            .map(|(idx, opt)| {
                let label = if opt.chars().count() > max_label_len {
                    format!("{}...", opt.chars().take(max_label_len).collect::<String>())
                } else {
                    opt.clone()
                };
                InlineButton {
                    label,
                    callback_data: format!("{prefix}:{idx}"),
                }
            })
            .collect();
        Self { buttons }
    }
}

/// Plain-text article answer for inline queries.
#[derive(Clone, Debug)]
pub struct InlineArticle {
    pub id: String,
    pub title: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{private_chat, text_message};

    #[test]
    fn entity_text_uses_utf16_offsets() {
        // "👋" is two UTF-16 code units.
        let mut msg = text_message(private_chat(1), "👋 /start now");
        msg.entities = vec![MessageEntity {
            kind: EntityKind::BotCommand,
            offset: 3,
            length: 6,
        }];
        assert_eq!(msg.command_tokens(), vec!["/start".to_string()]);
    }

    #[test]
    fn entity_outside_text_is_ignored() {
        let mut msg = text_message(private_chat(1), "/a");
        msg.entities = vec![MessageEntity {
            kind: EntityKind::BotCommand,
            offset: 1,
            length: 10,
        }];
        assert!(msg.command_tokens().is_empty());
    }

    #[test]
    fn keyboard_truncates_long_labels() {
        let kb = InlineKeyboard::one_per_row(
            "pick",
            &["short".to_string(), "a very long option label".to_string()],
            6,
        );
        assert_eq!(kb.buttons[0].label, "short");
        assert_eq!(kb.buttons[1].label, "a very...");
        assert_eq!(kb.buttons[1].callback_data, "pick:1");
    }
}
