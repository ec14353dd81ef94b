use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::{debug, info};

use chatstate_core::Engine;

use crate::convert;

/// Long-poll Telegram and feed every update to `engine` until the process is
/// interrupted, then stop the engine (stop hooks run, queued work drains).
///
/// Per-update failures are logged by the engine; polling never stops on them.
pub async fn run_polling(engine: Engine, bot: Bot) -> anyhow::Result<()> {
    let me = engine.me().await?;
    info!(bot = %me.username, mode = %engine.config().mode, "chatstate started");

    engine.start().await?;

    let handler = dptree::entry().endpoint(handle_update);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("polling stopped, shutting down engine");
    engine.stop().await;
    Ok(())
}

async fn handle_update(update: Update, engine: Engine) -> ResponseResult<()> {
    let Some(converted) = convert::update(&update) else {
        debug!(update_id = update.id, "ignoring unsupported update kind");
        return Ok(());
    };

    // The engine already logged the failure with its context.
    if let Err(e) = engine.dispatch(converted).await {
        debug!(update_id = update.id, "update not dispatched: {e}");
    }
    Ok(())
}
