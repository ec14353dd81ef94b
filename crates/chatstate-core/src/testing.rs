//! In-memory fakes and update builders shared by unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use async_trait::async_trait;

use crate::{
    context::{ChatInfo, SessionContext},
    domain::{BotIdentity, ChatId, ChatKind, MessageId, MessageRef, UserId},
    errors::Error,
    handler::{ClassBinding, HandlerClass, RegisteredClass},
    messaging::{
        port::MessagingPort,
        types::{
            CallbackQuery, Chat, EntityKind, FileRef, InlineArticle, InlineKeyboard, InlineQuery,
            Message, MessageEntity, ParseMode, User,
        },
    },
    session::Session,
    Result,
};

pub(crate) const BOT_ID: i64 = 999;
pub(crate) const BOT_USERNAME: &str = "thisbot";

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Sent {
    pub chat_id: ChatId,
    pub text: String,
    pub parse_mode: Option<ParseMode>,
}

#[derive(Default)]
pub(crate) struct FakePlatform {
    next_id: AtomicI32,
    get_me_calls: AtomicUsize,
    fail_acks: AtomicBool,
    fail_get_me: AtomicBool,
    sent: Mutex<Vec<Sent>>,
    keyboards: Mutex<Vec<(ChatId, String, InlineKeyboard)>>,
    acks: Mutex<Vec<(String, Option<String>)>>,
    inline_answers: Mutex<Vec<(String, Vec<InlineArticle>)>>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn identity() -> BotIdentity {
        BotIdentity {
            id: UserId(BOT_ID),
            username: BOT_USERNAME.to_string(),
        }
    }

    /// Make every callback acknowledgement fail.
    pub(crate) fn failing_acks(self) -> Self {
        self.fail_acks.store(true, Ordering::SeqCst);
        self
    }

    /// Make fetching the bot identity fail.
    pub(crate) fn failing_get_me(self) -> Self {
        self.fail_get_me.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_texts(&self, chat_id: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.chat_id == chat_id)
            .map(|s| s.text)
            .collect()
    }

    pub(crate) fn keyboards(&self) -> Vec<(ChatId, String, InlineKeyboard)> {
        self.keyboards.lock().unwrap().clone()
    }

    pub(crate) fn acks(&self) -> Vec<(String, Option<String>)> {
        self.acks.lock().unwrap().clone()
    }

    pub(crate) fn inline_answers(&self) -> Vec<(String, Vec<InlineArticle>)> {
        self.inline_answers.lock().unwrap().clone()
    }

    pub(crate) fn get_me_calls(&self) -> usize {
        self.get_me_calls.load(Ordering::SeqCst)
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }

    fn record(&self, chat_id: ChatId, text: &str, parse_mode: Option<ParseMode>) -> MessageRef {
        self.sent.lock().unwrap().push(Sent {
            chat_id,
            text: text.to_string(),
            parse_mode,
        });
        self.alloc(chat_id)
    }
}

#[async_trait]
impl MessagingPort for FakePlatform {
    async fn get_me(&self) -> Result<BotIdentity> {
        self.get_me_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_me.load(Ordering::SeqCst) {
            return Err(Error::Platform("bad gateway".to_string()));
        }
        Ok(Self::identity())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageRef> {
        Ok(self.record(chat_id, text, parse_mode))
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.keyboards
            .lock()
            .unwrap()
            .push((chat_id, text.to_string(), keyboard));
        Ok(self.alloc(chat_id))
    }

    async fn edit_message_text(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.record(msg.chat_id, text, None);
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let text = format!("[photo {photo:?}] {}", caption.unwrap_or_default());
        Ok(self.record(chat_id, &text, None))
    }

    async fn send_video(
        &self,
        chat_id: ChatId,
        video: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let text = format!("[video {video:?}] {}", caption.unwrap_or_default());
        Ok(self.record(chat_id, &text, None))
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.acks
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.map(str::to_string)));
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(Error::Platform("query is too old".to_string()));
        }
        Ok(())
    }

    async fn answer_inline_query(&self, query_id: &str, results: Vec<InlineArticle>) -> Result<()> {
        self.inline_answers
            .lock()
            .unwrap()
            .push((query_id.to_string(), results));
        Ok(())
    }
}

/// Session with a handler class that declares nothing, detached from any engine.
pub(crate) fn bare_session(chat: &Chat) -> Session {
    let info = ChatInfo::from(chat);
    let cx = SessionContext::new(
        info.clone(),
        FakePlatform::identity(),
        Arc::new(FakePlatform::new()),
        Weak::new(),
    );
    let handler = RegisteredClass::resolve(HandlerClass::new("bare", |_| ()), &[info.kind])
        .and_then(|class| class.bind(&cx, None))
        .unwrap();
    Session::new(cx, handler, None)
}

static NEXT_MESSAGE_ID: AtomicI32 = AtomicI32::new(1);

pub(crate) fn private_chat(id: i64) -> Chat {
    Chat {
        id: ChatId(id),
        kind: ChatKind::Private,
        username: Some(format!("user{id}")),
        title: None,
        first_name: Some("Test".to_string()),
        last_name: None,
    }
}

pub(crate) fn group_chat(id: i64, title: &str) -> Chat {
    Chat {
        id: ChatId(id),
        kind: ChatKind::Group,
        username: None,
        title: Some(title.to_string()),
        first_name: None,
        last_name: None,
    }
}

pub(crate) fn user(id: i64) -> User {
    User {
        id: UserId(id),
        is_bot: false,
        first_name: format!("User {id}"),
        last_name: None,
        username: Some(format!("user{id}")),
    }
}

pub(crate) fn bot_user() -> User {
    User {
        id: UserId(BOT_ID),
        is_bot: true,
        first_name: "This Bot".to_string(),
        last_name: None,
        username: Some(BOT_USERNAME.to_string()),
    }
}

/// Text message with a bot-command entity for every word starting with `/`,
/// the way the platform marks them up.
pub(crate) fn text_message(chat: Chat, text: &str) -> Message {
    let from = Some(user(chat.id.0.abs()));
    Message {
        id: MessageId(NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst)),
        chat,
        from,
        text: Some(text.to_string()),
        entities: command_entities(text),
        new_chat_members: Vec::new(),
        left_chat_member: None,
        media: None,
    }
}

/// Service message without text (joins, departures, media).
pub(crate) fn service_message(chat: Chat) -> Message {
    let mut msg = text_message(chat, "");
    msg.text = None;
    msg
}

pub(crate) fn callback_query(id: &str, chat: Chat, data: &str) -> CallbackQuery {
    CallbackQuery {
        id: id.to_string(),
        from: user(chat.id.0.abs()),
        message: Some(service_message(chat)),
        data: Some(data.to_string()),
    }
}

pub(crate) fn inline_query(id: &str, query: &str) -> InlineQuery {
    InlineQuery {
        id: id.to_string(),
        from: user(1),
        query: query.to_string(),
        offset: String::new(),
    }
}

fn command_entities(text: &str) -> Vec<MessageEntity> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut start: Option<usize> = None;
    let mut after_space = true;

    for ch in text.chars() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                out.push(command_entity(s, pos - s));
            }
            after_space = true;
        } else {
            if after_space && ch == '/' {
                start = Some(pos);
            }
            after_space = false;
        }
        pos += ch.len_utf16();
    }
    if let Some(s) = start {
        out.push(command_entity(s, pos - s));
    }
    out
}

fn command_entity(offset: usize, length: usize) -> MessageEntity {
    MessageEntity {
        kind: EntityKind::BotCommand,
        offset,
        length,
    }
}
