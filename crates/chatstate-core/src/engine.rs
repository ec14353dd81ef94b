//! The engine: owns the registries, the session table, the dispatcher and the
//! idle reaper, and exposes the public API applications talk to.

use std::{
    future::Future,
    sync::{Arc, RwLock},
};

use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    context::{ChatInfo, InlineContext},
    dispatcher::{DispatchMode, Task, TaskDispatcher},
    domain::{BotIdentity, ChatId, ChatKind},
    errors::{Error, HandlerResult},
    handler::{ClassBinding, HandlerClass},
    messaging::{
        port::MessagingPort,
        types::{Event, InlineQuery, Update},
    },
    reaper::{self, IdleReaper},
    registry::{HandlerRegistry, InlineQueryFn, InlineQueryRegistry},
    session::Session,
    store::{SerializedSession, SessionStore},
    table::SessionTable,
    utils::{read, write},
    Result,
};

/// Why a session left the table other than by idle eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// `/stop` addressed to the bot.
    Stop,
    /// The bot itself left the conversation.
    Departed,
    /// A handler called `SessionContext::remove_session`.
    Handler,
    /// The application called `Engine::remove_session`.
    Api,
}

pub(crate) struct EngineInner {
    pub(crate) cfg: EngineConfig,
    pub(crate) platform: Arc<dyn MessagingPort>,
    pub(crate) store: Option<Arc<dyn SessionStore>>,
    registry: RwLock<HandlerRegistry>,
    inline: RwLock<InlineQueryRegistry>,
    pub(crate) table: SessionTable,
    pub(crate) dispatcher: TaskDispatcher,
    me: OnceCell<BotIdentity>,
    reaper: tokio::sync::Mutex<Option<IdleReaper>>,
}

impl EngineInner {
    pub(crate) fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    /// The bot's identity, fetched from the platform on first use.
    pub(crate) async fn me(&self) -> Result<BotIdentity> {
        self.me
            .get_or_try_init(|| async {
                let me = self
                    .platform
                    .get_me()
                    .await
                    .map_err(|e| Error::Platform(format!("failed to fetch bot identity: {e}")))?;
                info!(bot_id = me.id.0, username = %me.username, "bot identity resolved");
                Ok::<_, Error>(me)
            })
            .await
            .cloned()
    }

    pub(crate) fn class_for(&self, kind: ChatKind) -> Option<Arc<dyn ClassBinding>> {
        read(&self.registry).resolve(kind)
    }

    pub(crate) fn inline_handler(&self, query: &str) -> Option<InlineQueryFn> {
        read(&self.inline).resolve(query)
    }

    pub(crate) fn inline_context(&self, me: BotIdentity) -> InlineContext {
        InlineContext::new(me, self.platform.clone())
    }

    /// Remove the chat's session. With `session_id` set, only that exact
    /// session is removed; a newer session for the same chat is left alone.
    pub(crate) async fn remove_session(
        &self,
        chat_id: ChatId,
        session_id: Option<u64>,
        reason: RemovalReason,
    ) -> bool {
        let removed = match session_id {
            Some(id) => self.table.remove_if_same(chat_id, id).await,
            None => self.table.remove(chat_id).await,
        };
        let Some(session) = removed else {
            debug!(chat_id = %chat_id, reason = ?reason, "no matching session to remove");
            return false;
        };
        session.mark_detached();
        info!(chat_id = %chat_id, reason = ?reason, "session removed");

        if let (Some(store), true) = (&self.store, session.is_persistent()) {
            if let Err(e) = store.delete(chat_id).await {
                warn!(chat_id = %chat_id, "failed to delete persisted session: {e}");
            }
        }
        true
    }

    pub(crate) async fn broadcast_event(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let event = Arc::new(Event {
            name: name.to_string(),
            payload,
        });
        let sessions = self.table.all().await;
        let count = sessions.len();

        for session in sessions {
            let chat_id = session.chat_id();
            let event = event.clone();
            let task = Task::new("event", async move { session.handle_event(&event).await })
                .in_lane(chat_id);
            self.dispatcher.submit(task).await?;
        }
        debug!(event = %name, sessions = count, "event broadcast");
        Ok(count)
    }

    pub(crate) async fn schedule_activation(&self, session: &Arc<Session>) -> Result<()> {
        let chat_id = session.chat_id();
        let session = session.clone();
        let task =
            Task::new("activate", async move { session.on_activate().await }).in_lane(chat_id);
        self.dispatcher.submit(task).await
    }
}

/// Handle to a running dispatch engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, platform: Arc<dyn MessagingPort>) -> Result<Self> {
        Self::build(cfg, platform, None)
    }

    /// Engine whose persistent handler classes save their state to `store`.
    pub fn with_store(
        cfg: EngineConfig,
        platform: Arc<dyn MessagingPort>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        Self::build(cfg, platform, Some(store))
    }

    fn build(
        cfg: EngineConfig,
        platform: Arc<dyn MessagingPort>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let dispatcher = TaskDispatcher::new(cfg.mode, cfg.workers);
        Ok(Self {
            inner: Arc::new(EngineInner {
                cfg,
                platform,
                store,
                registry: RwLock::new(HandlerRegistry::new()),
                inline: RwLock::new(InlineQueryRegistry::new()),
                table: SessionTable::new(),
                dispatcher,
                me: OnceCell::new(),
                reaper: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.cfg
    }

    pub fn platform(&self) -> &Arc<dyn MessagingPort> {
        &self.inner.platform
    }

    pub fn register_handler_class<H: Send + 'static>(
        &self,
        kinds: &[ChatKind],
        class: HandlerClass<H>,
    ) -> Result<()> {
        write(&self.inner.registry).register(kinds, class)
    }

    /// Register a handler for inline queries starting with `prefix`
    /// (case-insensitive; `""` catches every query).
    pub fn register_inline_query_handler<F, Fut>(&self, prefix: &str, f: F) -> Result<()>
    where
        F: Fn(InlineContext, InlineQuery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: InlineQueryFn = Arc::new(move |cx, query| f(cx, query).boxed());
        write(&self.inner.inline).register(prefix, handler)
    }

    pub async fn me(&self) -> Result<BotIdentity> {
        self.inner.me().await
    }

    /// Route one inbound update. Returns once the work is queued (pooled mode)
    /// or done (inline mode).
    pub async fn dispatch(&self, update: Update) -> Result<()> {
        self.inner.dispatch(update).await
    }

    /// Deliver an event to every live session. Returns how many sessions it
    /// was queued for.
    pub async fn broadcast_event(&self, name: &str, payload: serde_json::Value) -> Result<usize> {
        self.inner.broadcast_event(name, payload).await
    }

    pub async fn remove_session(&self, chat_id: ChatId) -> bool {
        self.inner
            .remove_session(chat_id, None, RemovalReason::Api)
            .await
    }

    pub async fn session(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        self.inner.table.get(chat_id).await
    }

    pub async fn session_count(&self) -> usize {
        self.inner.table.len().await
    }

    /// Run one idle sweep now. Returns the evicted chats.
    pub async fn sweep_idle(&self) -> Vec<ChatId> {
        reaper::sweep(&self.inner.table, self.inner.cfg.idle_timeout).await
    }

    /// Recreate a session from a persisted record without waiting for an
    /// update from its chat. A chat that already has a session keeps it.
    pub async fn adopt_session(&self, record: SerializedSession) -> Result<Arc<Session>> {
        let chat: ChatInfo = record.chat.clone();
        if let Some(class) = self.inner.class_for(chat.kind) {
            if class.name() != record.class {
                return Err(Error::Config(format!(
                    "record for chat {} was written by class {}, but {} chats are served by {}",
                    chat.id,
                    record.class,
                    chat.kind,
                    class.name()
                )));
            }
        }
        self.inner.open_session(chat, Some(record.state)).await
    }

    /// Spawn the worker pool and the idle reaper.
    pub async fn start(&self) -> Result<()> {
        self.inner.dispatcher.start()?;

        let mut reaper = self.inner.reaper.lock().await;
        if reaper.is_none() {
            *reaper = Some(IdleReaper::spawn(
                Arc::downgrade(&self.inner),
                self.inner.cfg.sweep_interval,
            ));
        }
        info!(
            mode = %self.inner.cfg.mode,
            workers = self.inner.cfg.workers,
            idle_timeout_secs = self.inner.cfg.idle_timeout.as_secs(),
            "engine started"
        );
        Ok(())
    }

    /// Stop the reaper, run every session's stop hook, then drain the
    /// dispatcher. Idempotent.
    pub async fn stop(&self) {
        if let Some(reaper) = self.inner.reaper.lock().await.take() {
            reaper.shutdown().await;
        }

        if !self.inner.dispatcher.is_stopped() {
            for session in self.inner.table.all().await {
                let chat_id = session.chat_id();
                let task =
                    Task::new("stop", async move { session.on_stop().await }).in_lane(chat_id);
                if let Err(e) = self.inner.dispatcher.submit(task).await {
                    warn!(chat_id = %chat_id, "could not schedule stop hook: {e}");
                }
            }
        }

        self.inner.dispatcher.stop().await;
        info!("engine stopped");
    }
}
