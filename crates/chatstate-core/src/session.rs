//! One conversation's session: the handler instance plus its bookkeeping.
//!
//! All handler invocations for a session go through its instance lock, so at
//! most one runs at a time even if the dispatcher were to overlap them. Errors
//! and panics raised by handler code stop here: they are logged and the event
//! counts as handled.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    context::{ChatInfo, SessionContext},
    domain::{ChatId, ChatKind},
    engine::RemovalReason,
    errors::{Error, HandlerResult},
    handler::{BoundHandler, Slot},
    messaging::types::{CallbackQuery, Event, Message},
    store::{SerializedSession, SessionStore},
    utils::{lock, panic_message},
};

pub struct Session {
    cx: SessionContext,
    class_name: String,
    last_active: Mutex<Instant>,
    handler: tokio::sync::Mutex<Box<dyn BoundHandler>>,
    store: Option<Arc<dyn SessionStore>>,
    detached: AtomicBool,
}

impl Session {
    /// Wrap a freshly bound handler. Activation is not run here.
    pub(crate) fn new(
        cx: SessionContext,
        handler: Box<dyn BoundHandler>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        let store = if handler.is_persistent() { store } else { None };
        Self {
            class_name: handler.class_name().to_string(),
            cx,
            last_active: Mutex::new(Instant::now()),
            handler: tokio::sync::Mutex::new(handler),
            store,
            detached: AtomicBool::new(false),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.cx.chat_id()
    }

    /// Unique per session; a chat's replacement session has a different id.
    pub fn id(&self) -> u64 {
        self.cx.session_id()
    }

    pub fn kind(&self) -> ChatKind {
        self.cx.kind()
    }

    pub fn chat(&self) -> &ChatInfo {
        self.cx.chat()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.cx.chat().display_name.as_deref()
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn context(&self) -> &SessionContext {
        &self.cx
    }

    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    /// Whether state is saved to a store after each handled event.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Removed from the table; no more state is persisted for it.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub async fn handle_message(&self, msg: &Message) {
        self.touch();
        let mut handler = self.handler.lock().await;
        if self.is_detached() {
            debug!(chat_id = %self.chat_id(), "dropping message queued for a removed session");
            return;
        }
        let plan = plan_message(&self.cx, &**handler, msg);

        if let Some(reason) = plan.remove {
            info!(chat_id = %self.chat_id(), reason = ?reason, "session removal requested");
            self.mark_detached();
            self.cx.remove_with(reason).await;
        }

        for slot in &plan.steps {
            if let Some(fut) = handler.call_message(slot, &self.cx, msg) {
                self.contain(&slot.label(), fut).await;
            }
        }

        let record = self.snapshot(&**handler);
        drop(handler);
        self.save(record).await;
    }

    /// Run the callback handler if any, then acknowledge the query exactly once.
    pub async fn handle_callback_query(&self, query: &CallbackQuery) {
        self.touch();
        let mut handler = self.handler.lock().await;

        // A removed session no longer handles buttons, but the query is
        // still acknowledged.
        let answer = if self.is_detached() {
            None
        } else {
            match handler.call_callback_query(&self.cx, query) {
                Some(fut) => self.contain("callback_query", fut).await.flatten(),
                None => None,
            }
        };

        let record = self.snapshot(&**handler);
        drop(handler);

        if let Err(e) = self
            .cx
            .platform()
            .answer_callback_query(&query.id, answer.as_deref())
            .await
        {
            warn!(chat_id = %self.chat_id(), callback_id = %query.id, "failed to acknowledge callback: {e}");
        }
        self.save(record).await;
    }

    /// Run every subscriber of `event.name`, in declaration order.
    pub async fn handle_event(&self, event: &Event) {
        self.touch();
        let mut handler = self.handler.lock().await;

        let subscribers = handler.subscribers(&event.name);
        if subscribers == 0 || self.is_detached() {
            return;
        }
        for idx in 0..subscribers {
            if let Some(fut) = handler.call_event(idx, &self.cx, event) {
                self.contain(&format!("event {}", event.name), fut).await;
            }
        }

        let record = self.snapshot(&**handler);
        drop(handler);
        self.save(record).await;
    }

    pub async fn on_activate(&self) {
        self.touch();
        let mut handler = self.handler.lock().await;
        if let Some(fut) = handler.call_activate(&self.cx) {
            self.contain("activate", fut).await;
        }

        let record = self.snapshot(&**handler);
        drop(handler);
        self.save(record).await;
    }

    /// `true` keeps the session alive. A missing or failing idle hook allows
    /// eviction.
    pub async fn on_idle_check(&self) -> bool {
        // A busy session is not idle; it is asked again on the next sweep.
        let Ok(mut handler) = self.handler.try_lock() else {
            debug!(chat_id = %self.chat_id(), "session busy, skipping idle check");
            return true;
        };
        let keep = match handler.call_idle(&self.cx) {
            Some(fut) => self.contain("idle", fut).await.unwrap_or(false),
            None => false,
        };
        keep
    }

    pub async fn on_stop(&self) {
        let mut handler = self.handler.lock().await;
        if let Some(fut) = handler.call_stop(&self.cx) {
            self.contain("stop", fut).await;
        }

        let record = self.snapshot(&**handler);
        drop(handler);
        self.save(record).await;
    }

    /// Await a handler future, turning errors and panics into log lines.
    async fn contain<T: Send>(
        &self,
        step: &str,
        fut: BoxFuture<'_, HandlerResult<T>>,
    ) -> Option<T> {
        let reason = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panicked: {}", panic_message(&*panic)),
        };

        let err = Error::HandlerExecution {
            chat_id: self.chat_id(),
            step: step.to_string(),
            reason,
        };
        error!(chat_id = %self.chat_id(), class = %self.class_name, "{err}");
        None
    }

    fn snapshot(&self, handler: &dyn BoundHandler) -> Option<SerializedSession> {
        self.store.as_ref()?;
        if self.is_detached() {
            return None;
        }
        match handler.snapshot()? {
            Ok(state) => Some(SerializedSession::new(
                self.cx.chat().clone(),
                self.class_name.clone(),
                state,
            )),
            Err(e) => {
                warn!(chat_id = %self.chat_id(), class = %self.class_name, "failed to snapshot session state: {e:#}");
                None
            }
        }
    }

    async fn save(&self, record: Option<SerializedSession>) {
        let (Some(store), Some(record)) = (&self.store, record) else {
            return;
        };
        match store.save(self.chat_id(), &record).await {
            Ok(()) => debug!(chat_id = %self.chat_id(), "session state saved"),
            Err(e) => warn!(chat_id = %self.chat_id(), "failed to save session state: {e}"),
        }
    }
}

/// Handler steps for one message, plus whether the message ends the session.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MessagePlan {
    pub steps: Vec<Slot>,
    pub remove: Option<RemovalReason>,
}

/// Order: addressed commands, membership changes, media, then the default
/// handler unless a command matched.
pub(crate) fn plan_message(
    cx: &SessionContext,
    handler: &dyn BoundHandler,
    msg: &Message,
) -> MessagePlan {
    let mut plan = MessagePlan::default();
    let mut command_matched = false;

    for token in msg.command_tokens() {
        let Some(command) = addressed_command(&token, cx.kind(), &cx.me().username) else {
            continue;
        };
        let slot = Slot::Command(command.to_string());
        let bound = handler.has_slot(&slot);
        if bound {
            plan.steps.push(slot);
            command_matched = true;
        }
        if command == "/stop" {
            plan.remove = Some(RemovalReason::Stop);
            return plan;
        }
    }

    if !msg.new_chat_members.is_empty() && handler.has_slot(&Slot::NewMember) {
        plan.steps.push(Slot::NewMember);
    }

    if let Some(left) = &msg.left_chat_member {
        if left.id == cx.me().id {
            plan.remove = Some(RemovalReason::Departed);
            return plan;
        }
        if handler.has_slot(&Slot::LeftMember) {
            plan.steps.push(Slot::LeftMember);
        }
    }

    if let Some(media) = &msg.media {
        let slot = Slot::Media(media.kind());
        if handler.has_slot(&slot) {
            plan.steps.push(slot);
        }
    }

    if !command_matched && handler.has_slot(&Slot::Message) {
        plan.steps.push(Slot::Message);
    }
    plan
}

/// The command a token addresses to this bot, without its `@name` suffix.
///
/// Private chats address every command to the bot. Elsewhere only
/// `/cmd@ourname` counts; a bare `/cmd` is meant for some other bot.
pub(crate) fn addressed_command<'t>(
    token: &'t str,
    kind: ChatKind,
    bot_username: &str,
) -> Option<&'t str> {
    match token.rsplit_once('@') {
        Some((command, target)) => {
            if kind == ChatKind::Private || target.eq_ignore_ascii_case(bot_username) {
                Some(command)
            } else {
                None
            }
        }
        None if kind == ChatKind::Private => Some(token),
        None => None,
    }
}
