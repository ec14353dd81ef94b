//! teloxide -> core update model.

use teloxide::types::{self as tg, MessageEntityKind, UpdateKind};

use chatstate_core::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    messaging::types::{
        CallbackQuery, Chat, EntityKind, InlineQuery, Media, Message, MessageEntity, Update, User,
    },
};

/// Convert an update the engine understands; `None` for every other kind
/// (edits, polls, membership changes of the bot itself, ...).
pub fn update(upd: &tg::Update) -> Option<Update> {
    let id = i64::from(upd.id);
    match &upd.kind {
        UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => {
            Some(Update::message(id, message(msg)))
        }
        UpdateKind::CallbackQuery(q) => Some(Update::callback_query(id, callback_query(q))),
        UpdateKind::InlineQuery(q) => Some(Update::inline_query(id, inline_query(q))),
        _ => None,
    }
}

pub fn chat(c: &tg::Chat) -> Chat {
    let kind = if c.is_private() {
        ChatKind::Private
    } else if c.is_group() {
        ChatKind::Group
    } else if c.is_supergroup() {
        ChatKind::Supergroup
    } else {
        ChatKind::Channel
    };

    Chat {
        id: ChatId(c.id.0),
        kind,
        username: c.username().map(str::to_string),
        title: c.title().map(str::to_string),
        first_name: c.first_name().map(str::to_string),
        last_name: c.last_name().map(str::to_string),
    }
}

pub fn user(u: &tg::User) -> User {
    User {
        id: UserId(u.id.0 as i64),
        is_bot: u.is_bot,
        first_name: u.first_name.clone(),
        last_name: u.last_name.clone(),
        username: u.username.clone(),
    }
}

fn entity(e: &tg::MessageEntity) -> MessageEntity {
    let kind = match e.kind {
        MessageEntityKind::BotCommand => EntityKind::BotCommand,
        MessageEntityKind::Mention => EntityKind::Mention,
        MessageEntityKind::Hashtag => EntityKind::Hashtag,
        MessageEntityKind::Url => EntityKind::Url,
        _ => EntityKind::Other,
    };
    // teloxide keeps the platform's UTF-16 offsets.
    MessageEntity {
        kind,
        offset: e.offset,
        length: e.length,
    }
}

fn media(msg: &tg::Message) -> Option<Media> {
    if let Some(doc) = msg.document() {
        return Some(Media::Document {
            file_id: doc.file.id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(largest) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(Media::Photo {
            file_id: largest.file.id.clone(),
        });
    }
    msg.video().map(|v| Media::Video {
        file_id: v.file.id.clone(),
    })
}

pub fn message(msg: &tg::Message) -> Message {
    Message {
        id: MessageId(msg.id.0),
        chat: chat(&msg.chat),
        from: msg.from().map(user),
        text: msg.text().map(str::to_string),
        entities: msg
            .entities()
            .map(|es| es.iter().map(entity).collect())
            .unwrap_or_default(),
        new_chat_members: msg
            .new_chat_members()
            .map(|us| us.iter().map(user).collect())
            .unwrap_or_default(),
        left_chat_member: msg.left_chat_member().map(user),
        media: media(msg),
    }
}

pub fn callback_query(q: &tg::CallbackQuery) -> CallbackQuery {
    CallbackQuery {
        id: q.id.clone(),
        from: user(&q.from),
        message: q.message.as_ref().map(message),
        data: q.data.clone(),
    }
}

pub fn inline_query(q: &tg::InlineQuery) -> InlineQuery {
    InlineQuery {
        id: q.id.clone(),
        from: user(&q.from),
        query: q.query.clone(),
        offset: q.offset.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> tg::Update {
        serde_json::from_str(&v.to_string()).unwrap()
    }

    fn from_user() -> serde_json::Value {
        json!({ "id": 11, "is_bot": false, "first_name": "Ada", "username": "ada" })
    }

    #[test]
    fn private_text_message_with_command_entity() {
        let upd = parse(json!({
            "update_id": 7,
            "message": {
                "message_id": 100,
                "date": 1_700_000_000,
                "chat": { "id": 11, "type": "private", "first_name": "Ada", "username": "ada" },
                "from": from_user(),
                "text": "👋 /help@thisbot",
                "entities": [{ "type": "bot_command", "offset": 3, "length": 13 }]
            }
        }));

        let out = update(&upd).unwrap();
        assert_eq!(out.id, 7);
        let msg = out.message.unwrap();
        assert_eq!(msg.chat.id, ChatId(11));
        assert_eq!(msg.chat.kind, ChatKind::Private);
        assert_eq!(msg.chat.display_name().as_deref(), Some("ada"));
        assert_eq!(msg.from.as_ref().unwrap().id, UserId(11));
        assert_eq!(msg.command_tokens(), vec!["/help@thisbot".to_string()]);
    }

    #[test]
    fn group_membership_changes() {
        let upd = parse(json!({
            "update_id": 8,
            "message": {
                "message_id": 5,
                "date": 1_700_000_000,
                "chat": { "id": -42, "type": "group", "title": "friends" },
                "from": from_user(),
                "new_chat_members": [
                    { "id": 12, "is_bot": false, "first_name": "Bob" },
                    { "id": 999, "is_bot": true, "first_name": "bot", "username": "thisbot" }
                ]
            }
        }));

        let msg = update(&upd).unwrap().message.unwrap();
        assert_eq!(msg.chat.kind, ChatKind::Group);
        assert_eq!(msg.chat.display_name().as_deref(), Some("friends"));
        assert_eq!(msg.new_chat_members.len(), 2);
        assert!(msg.new_chat_members[1].is_bot);
        assert!(msg.text.is_none());
    }

    #[test]
    fn photo_uses_largest_size() {
        let upd = parse(json!({
            "update_id": 9,
            "message": {
                "message_id": 6,
                "date": 1_700_000_000,
                "chat": { "id": -1001, "type": "supergroup", "title": "big" },
                "from": from_user(),
                "photo": [
                    { "file_id": "small", "file_unique_id": "s", "width": 90, "height": 90 },
                    { "file_id": "large", "file_unique_id": "l", "width": 800, "height": 800 }
                ]
            }
        }));

        let msg = update(&upd).unwrap().message.unwrap();
        assert_eq!(msg.chat.kind, ChatKind::Supergroup);
        assert!(matches!(msg.media, Some(Media::Photo { ref file_id }) if file_id == "large"));
    }

    #[test]
    fn callback_and_inline_queries() {
        let cb = parse(json!({
            "update_id": 10,
            "callback_query": {
                "id": "cb-1",
                "from": from_user(),
                "chat_instance": "ci",
                "data": "pick:1",
                "message": {
                    "message_id": 3,
                    "date": 1_700_000_000,
                    "chat": { "id": 11, "type": "private", "first_name": "Ada" },
                    "text": "choose"
                }
            }
        }));
        let q = update(&cb).unwrap().callback_query.unwrap();
        assert_eq!(q.id, "cb-1");
        assert_eq!(q.data.as_deref(), Some("pick:1"));
        assert_eq!(q.message.unwrap().chat.id, ChatId(11));

        let iq = parse(json!({
            "update_id": 11,
            "inline_query": {
                "id": "iq-1",
                "from": from_user(),
                "query": "gif cats",
                "offset": ""
            }
        }));
        let q = update(&iq).unwrap().inline_query.unwrap();
        assert_eq!(q.query, "gif cats");
    }
}
