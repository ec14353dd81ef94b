//! Background eviction of idle sessions.

use std::{sync::Weak, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{domain::ChatId, engine::EngineInner, table::SessionTable};

/// Periodic sweeper task. Holds the engine weakly and exits when it is gone.
pub struct IdleReaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdleReaper {
    pub(crate) fn spawn(engine: Weak<EngineInner>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let tok = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tok.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        sweep(&engine.table, engine.cfg.idle_timeout).await;
                    }
                }
            }
            debug!("idle reaper exiting");
        });

        Self { cancel, handle }
    }

    /// Cancel the sweeper and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("idle reaper ended abnormally: {e}");
        }
    }
}

/// One sweep: ask every session idle for longer than `timeout` whether it may
/// go, and evict those that agree and are still idle. Keeping a session alive
/// does not reset its clock, so it is asked again on the next sweep.
pub async fn sweep(table: &SessionTable, timeout: Duration) -> Vec<ChatId> {
    let mut evicted = Vec::new();

    for session in table.idle_candidates(timeout).await {
        let chat_id = session.chat_id();
        if session.on_idle_check().await {
            debug!(chat_id = %chat_id, "idle session kept alive by its handler");
            continue;
        }
        if table.remove_if_idle(chat_id, &session, timeout).await {
            session.mark_detached();
            info!(
                chat_id = %chat_id,
                idle_secs = session.idle_for(Instant::now()).as_secs(),
                "evicted idle session"
            );
            evicted.push(chat_id);
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::{bare_session, private_chat};

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_sessions_past_the_timeout() {
        let table = SessionTable::new();
        let timeout = Duration::from_secs(30);

        let old = Arc::new(bare_session(&private_chat(1)));
        table.insert(old.clone()).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        table.insert(Arc::new(bare_session(&private_chat(2)))).await;
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(sweep(&table, timeout).await, vec![ChatId(1)]);
        assert!(old.is_detached());
        assert_eq!(table.len().await, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(sweep(&table, timeout).await, vec![ChatId(2)]);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_task() {
        let reaper = IdleReaper::spawn(Weak::new(), Duration::from_secs(1));
        reaper.shutdown().await;
    }
}
