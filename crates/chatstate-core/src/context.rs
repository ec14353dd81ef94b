use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::DispatchMode,
    domain::{BotIdentity, ChatId, ChatKind, MessageRef},
    engine::{EngineInner, RemovalReason},
    messaging::{
        port::MessagingPort,
        types::{Chat, FileRef, InlineArticle, InlineKeyboard, ParseMode},
    },
    Result,
};

/// What a session remembers about its conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: ChatId,
    pub kind: ChatKind,
    /// Username for private chats, title otherwise.
    pub display_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl From<&Chat> for ChatInfo {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id,
            kind: chat.kind,
            display_name: chat.display_name(),
            first_name: chat.first_name.clone(),
            last_name: chat.last_name.clone(),
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle given to handler functions: the session's conversation plus the
/// operations a handler may perform on it.
#[derive(Clone)]
pub struct SessionContext {
    session_id: u64,
    chat: ChatInfo,
    me: BotIdentity,
    platform: Arc<dyn MessagingPort>,
    engine: Weak<EngineInner>,
}

impl SessionContext {
    pub(crate) fn new(
        chat: ChatInfo,
        me: BotIdentity,
        platform: Arc<dyn MessagingPort>,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            chat,
            me,
            platform,
            engine,
        }
    }

    /// Identifies the session this context was built for. A chat that is
    /// stopped and contacted again gets a session with a new id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn chat(&self) -> &ChatInfo {
        &self.chat
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat.id
    }

    pub fn kind(&self) -> ChatKind {
        self.chat.kind
    }

    pub fn me(&self) -> &BotIdentity {
        &self.me
    }

    pub fn platform(&self) -> &Arc<dyn MessagingPort> {
        &self.platform
    }

    pub async fn send_text(&self, text: &str) -> Result<MessageRef> {
        self.platform.send_message(self.chat.id, text, None).await
    }

    pub async fn send_html(&self, html: &str) -> Result<MessageRef> {
        self.platform
            .send_message(self.chat.id, html, Some(ParseMode::Html))
            .await
    }

    pub async fn send_keyboard(&self, text: &str, keyboard: InlineKeyboard) -> Result<MessageRef> {
        self.platform
            .send_inline_keyboard(self.chat.id, text, keyboard)
            .await
    }

    pub async fn send_photo(&self, photo: FileRef, caption: Option<&str>) -> Result<MessageRef> {
        self.platform.send_photo(self.chat.id, photo, caption).await
    }

    pub async fn send_video(&self, video: FileRef, caption: Option<&str>) -> Result<MessageRef> {
        self.platform.send_video(self.chat.id, video, caption).await
    }

    pub async fn edit_text(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.platform.edit_message_text(msg, text).await
    }

    /// Remove this session from the engine. The current handler call still
    /// completes; later updates for the conversation create a fresh session.
    ///
    /// Returns `false` if the session was already gone, including when the
    /// chat has since been given a newer session (which is left alone).
    pub async fn remove_session(&self) -> bool {
        self.remove_with(RemovalReason::Handler).await
    }

    pub(crate) async fn remove_with(&self, reason: RemovalReason) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        engine
            .remove_session(self.chat.id, Some(self.session_id), reason)
            .await
    }

    /// Fan an event out to every session, this one included.
    ///
    /// The handlers run asynchronously, after the current handler call returns.
    pub async fn broadcast_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };

        match engine.mode() {
            DispatchMode::Pooled => engine.broadcast_event(name, payload).await.map(|_| ()),
            // Inline submission would re-enter this session's handler lock.
            DispatchMode::Inline => {
                let name = name.to_string();
                tokio::spawn(async move {
                    if let Err(e) = engine.broadcast_event(&name, payload).await {
                        tracing::warn!(event = %name, "broadcast from handler failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }
}

/// Handle given to inline-query handlers. Inline queries belong to no
/// conversation, so only platform access is available.
#[derive(Clone)]
pub struct InlineContext {
    me: BotIdentity,
    platform: Arc<dyn MessagingPort>,
}

impl InlineContext {
    pub(crate) fn new(me: BotIdentity, platform: Arc<dyn MessagingPort>) -> Self {
        Self { me, platform }
    }

    pub fn me(&self) -> &BotIdentity {
        &self.me
    }

    pub fn platform(&self) -> &Arc<dyn MessagingPort> {
        &self.platform
    }

    pub async fn answer(&self, query_id: &str, results: Vec<InlineArticle>) -> Result<()> {
        self.platform.answer_inline_query(query_id, results).await
    }
}
