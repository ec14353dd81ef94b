use async_trait::async_trait;

use crate::{
    domain::{BotIdentity, ChatId, MessageRef},
    messaging::types::{FileRef, InlineArticle, InlineKeyboard, ParseMode},
    Result,
};

/// Outbound port to the chat platform.
///
/// Telegram is the first implementation; the engine only ever talks to the
/// platform through this trait, so tests run against an in-memory fake.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    /// Identity of the bot account. Called once, before the first dispatch.
    async fn get_me(&self) -> Result<BotIdentity>;

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageRef>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn edit_message_text(&self, msg: MessageRef, text: &str) -> Result<()>;

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef>;

    async fn send_video(
        &self,
        chat_id: ChatId,
        video: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef>;

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    async fn answer_inline_query(&self, query_id: &str, results: Vec<InlineArticle>)
        -> Result<()>;
}
