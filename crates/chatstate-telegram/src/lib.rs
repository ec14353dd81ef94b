//! Telegram adapter (teloxide).
//!
//! This crate implements the `chatstate-core` MessagingPort over the Telegram
//! Bot API, converts teloxide updates into the core update model and runs the
//! long-polling loop that feeds an [`Engine`](chatstate_core::Engine).

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{
        InlineKeyboardButton, InlineKeyboardMarkup, InlineQueryResult, InlineQueryResultArticle,
        InputFile, InputMessageContent, InputMessageContentText,
    },
};

use tokio::time::sleep;

pub mod convert;
pub mod router;

use chatstate_core::{
    domain::{BotIdentity, ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{FileRef, InlineArticle, InlineKeyboard, ParseMode},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn tg_parse_mode(mode: ParseMode) -> teloxide::types::ParseMode {
        match mode {
            ParseMode::Html => teloxide::types::ParseMode::Html,
            ParseMode::MarkdownV2 => teloxide::types::ParseMode::MarkdownV2,
        }
    }

    fn input_file(file: FileRef) -> Result<InputFile> {
        match file {
            FileRef::Id(id) => Ok(InputFile::file_id(id)),
            FileRef::Url(raw) => {
                let url = url::Url::parse(&raw)
                    .map_err(|e| Error::Platform(format!("invalid file url {raw:?}: {e}")))?;
                Ok(InputFile::url(url))
            }
        }
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Platform(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(teloxide::RequestError::RetryAfter(wait)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(?wait, "rate limited by telegram, retrying");
                    sleep(wait).await;
                }
                Err(other) => return Err(Self::map_err(other)),
            }
        }
    }

    fn sent(chat_id: ChatId, msg: &teloxide::types::Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramClient {
    async fn get_me(&self) -> Result<BotIdentity> {
        let me = self.with_retry(|| self.bot.get_me()).await?;
        Ok(BotIdentity {
            id: UserId(me.user.id.0 as i64),
            username: me.username().to_string(),
        })
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_message(Self::tg_chat(chat_id), text.to_string());
                if let Some(mode) = parse_mode {
                    req = req.parse_mode(Self::tg_parse_mode(mode));
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .into_iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label, b.callback_data)])
            .collect();
        let markup = InlineKeyboardMarkup::new(rows);

        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), text.to_string())
                    .parse_mode(teloxide::types::ParseMode::Html)
                    .reply_markup(markup.clone())
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn edit_message_text(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot.edit_message_text(
                Self::tg_chat(msg.chat_id),
                Self::tg_msg_id(msg.message_id),
                text.to_string(),
            )
        })
        .await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let file = Self::input_file(photo)?;
        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_photo(Self::tg_chat(chat_id), file.clone());
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn send_video(
        &self,
        chat_id: ChatId,
        video: FileRef,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let file = Self::input_file(video)?;
        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_video(Self::tg_chat(chat_id), file.clone());
                if let Some(c) = caption {
                    req = req.caption(c.to_string());
                }
                req
            })
            .await?;
        Ok(Self::sent(chat_id, &msg))
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn answer_inline_query(
        &self,
        query_id: &str,
        results: Vec<InlineArticle>,
    ) -> Result<()> {
        let results: Vec<InlineQueryResult> = results
            .into_iter()
            .map(|a| {
                InlineQueryResult::Article(InlineQueryResultArticle::new(
                    a.id,
                    a.title,
                    InputMessageContent::Text(InputMessageContentText::new(a.text)),
                ))
            })
            .collect();

        self.with_retry(|| {
            self.bot
                .answer_inline_query(query_id.to_string(), results.clone())
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_refs_map_to_input_files() {
        assert!(TelegramClient::input_file(FileRef::Id("AgACAgIAAx".to_string())).is_ok());
        assert!(
            TelegramClient::input_file(FileRef::Url("https://example.com/cat.jpg".to_string()))
                .is_ok()
        );
        assert!(matches!(
            TelegramClient::input_file(FileRef::Url("not a url".to_string())),
            Err(Error::Platform(_))
        ));
    }

    #[test]
    fn ids_convert_both_ways() {
        assert_eq!(TelegramClient::tg_chat(ChatId(-100123)).0, -100123);
        assert_eq!(TelegramClient::tg_msg_id(MessageId(42)).0, 42);
    }
}
