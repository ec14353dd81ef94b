use std::{sync::Arc, time::Duration};

use teloxide::Bot;
use tracing::{info, warn};

use chatstate_core::{
    config::Config,
    domain::ChatKind,
    messaging::port::MessagingPort,
    store::{JsonDirStore, SessionStore},
    Engine,
};
use chatstate_telegram::TelegramClient;

mod demo;

const TICK_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), chatstate_core::Error> {
    chatstate_core::logging::init("chatstate")?;

    let cfg = Config::load()?;
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let platform: Arc<dyn MessagingPort> = Arc::new(TelegramClient::new(bot.clone()));

    let engine = match &cfg.store_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            info!(dir = %dir.display(), "persisting sessions");
            let store: Arc<dyn SessionStore> = Arc::new(JsonDirStore::new(dir.clone()));
            Engine::with_store(cfg.engine.clone(), platform, store)?
        }
        None => Engine::new(cfg.engine.clone(), platform)?,
    };

    engine.register_handler_class(
        &[ChatKind::Private, ChatKind::Group, ChatKind::Supergroup],
        demo::counter_class(),
    )?;
    engine.register_inline_query_handler("", demo::inline_echo)?;

    let ticker = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut every = tokio::time::interval(TICK_EVERY);
            every.tick().await;
            loop {
                every.tick().await;
                match engine.broadcast_event("tick", serde_json::json!({})).await {
                    Ok(n) => tracing::debug!(sessions = n, "tick broadcast"),
                    Err(e) => {
                        warn!("tick broadcast stopped: {e}");
                        break;
                    }
                }
            }
        })
    };

    let result = chatstate_telegram::router::run_polling(engine, bot).await;
    ticker.abort();

    result.map_err(|e| chatstate_core::Error::Platform(format!("telegram bot failed: {e}")))?;
    Ok(())
}
