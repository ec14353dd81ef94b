//! Demo handler class: a per-chat counter with buttons, a periodic tick and an
//! inline-query echo.

use serde::{Deserialize, Serialize};

use chatstate_core::{
    context::{InlineContext, SessionContext},
    domain::{
        ChatKind::{self, *},
        MessageRef,
    },
    handler::HandlerClass,
    messaging::types::{
        CallbackQuery, Event, FileRef, InlineArticle, InlineButton, InlineKeyboard, InlineQuery, Media,
        MediaKind, Message,
    },
    BoxFuture, HandlerResult,
};

const HELP: &str = "<b>chatstate demo</b>\n\
/count - show the counter\n\
/help - this message\n\
/stop - forget this chat\n\
Anything else is echoed back.";

const SERVED: &[ChatKind] = &[Private, Group, Supergroup];

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Counter {
    count: u64,
    ticks: u64,
    #[serde(default)]
    echo: bool,
}

impl Counter {
    fn keyboard(&self) -> InlineKeyboard {
        InlineKeyboard::new(vec![
            InlineButton {
                label: "+1".to_string(),
                callback_data: "count:inc".to_string(),
            },
            InlineButton {
                label: "reset".to_string(),
                callback_data: "count:reset".to_string(),
            },
            InlineButton {
                label: if self.echo { "echo off" } else { "echo on" }.to_string(),
                callback_data: "echo:toggle".to_string(),
            },
        ])
    }
}

pub fn counter_class() -> HandlerClass<Counter> {
    HandlerClass::new("counter", |_| Counter {
        echo: true,
        ..Counter::default()
    })
    .persistent()
    .activate(SERVED, on_activate)
    .command(SERVED, &["/start", "/help"], on_help)
    .command(SERVED, &["/count"], on_count)
    .message(SERVED, on_message)
    .media(&[Private], MediaKind::Photo, on_photo)
    .new_member(&[Group, Supergroup], on_new_member)
    .callback_query(SERVED, on_button)
    .event(SERVED, "tick", on_tick)
    .idle(SERVED, on_idle)
    .stop(SERVED, on_stop)
}

fn on_activate<'a>(c: &'a mut Counter, cx: &'a SessionContext) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        tracing::info!(chat_id = %cx.chat_id(), count = c.count, "counter session active");
        Ok(())
    })
}

fn on_help<'a>(_: &'a mut Counter, cx: &'a SessionContext, _: &'a Message) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        cx.send_html(HELP).await?;
        Ok(())
    })
}

fn on_count<'a>(c: &'a mut Counter, cx: &'a SessionContext, _: &'a Message) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let text = format!("Count: <b>{}</b> (ticks seen: {})", c.count, c.ticks);
        cx.send_keyboard(&text, c.keyboard()).await?;
        Ok(())
    })
}

fn on_message<'a>(c: &'a mut Counter, cx: &'a SessionContext, m: &'a Message) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        c.count += 1;
        if let Some(text) = m.text.as_deref().filter(|_| c.echo) {
            cx.send_text(text).await?;
        }
        Ok(())
    })
}

fn on_photo<'a>(_: &'a mut Counter, cx: &'a SessionContext, m: &'a Message) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if let Some(Media::Photo { file_id }) = &m.media {
            cx.send_photo(FileRef::Id(file_id.clone()), Some("right back at you"))
                .await?;
        }
        Ok(())
    })
}

fn on_new_member<'a>(_: &'a mut Counter, cx: &'a SessionContext, m: &'a Message) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        for member in m.new_chat_members.iter().filter(|u| !u.is_bot) {
            cx.send_text(&format!("Welcome, {}!", member.first_name)).await?;
        }
        Ok(())
    })
}

fn on_button<'a>(
    c: &'a mut Counter,
    cx: &'a SessionContext,
    q: &'a CallbackQuery,
) -> BoxFuture<'a, HandlerResult<Option<String>>> {
    Box::pin(async move {
        let answer = match q.data.as_deref() {
            Some("count:inc") => {
                c.count += 1;
                format!("count is now {}", c.count)
            }
            Some("count:reset") => {
                c.count = 0;
                "counter reset".to_string()
            }
            Some("echo:toggle") => {
                c.echo = !c.echo;
                format!("echo {}", if c.echo { "on" } else { "off" })
            }
            _ => return Ok(None),
        };

        if let Some(msg) = &q.message {
            let text = format!("Count: <b>{}</b> (ticks seen: {})", c.count, c.ticks);
            cx.edit_text(
                MessageRef {
                    chat_id: msg.chat.id,
                    message_id: msg.id,
                },
                &text,
            )
            .await?;
        }
        Ok(Some(answer))
    })
}

fn on_tick<'a>(c: &'a mut Counter, _: &'a SessionContext, _: &'a Event) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        c.ticks += 1;
        Ok(())
    })
}

/// Without a store an evicted chat loses its count, so only chats that never
/// counted anything may go.
fn on_idle<'a>(c: &'a mut Counter, _: &'a SessionContext) -> BoxFuture<'a, HandlerResult<bool>> {
    Box::pin(async move { Ok(c.count > 0) })
}

fn on_stop<'a>(c: &'a mut Counter, cx: &'a SessionContext) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        tracing::debug!(chat_id = %cx.chat_id(), count = c.count, "counter session stopping");
        Ok(())
    })
}

/// Inline mode: offer the query text back as an article.
pub async fn inline_echo(cx: InlineContext, query: InlineQuery) -> HandlerResult {
    let text = query.query.trim();
    if text.is_empty() {
        return Ok(());
    }
    let article = InlineArticle {
        id: "echo".to_string(),
        title: format!("Send \"{text}\""),
        text: text.to_string(),
    };
    cx.answer(&query.id, vec![article]).await?;
    Ok(())
}
