//! Update routing: map each inbound update to its conversation's session
//! (creating it on first contact) and hand the work to the dispatcher.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::{
    context::{ChatInfo, SessionContext},
    dispatcher::Task,
    domain::BotIdentity,
    engine::EngineInner,
    errors::Error,
    messaging::types::{CallbackQuery, Chat, InlineQuery, Message, Update},
    session::Session,
    Result,
};

impl EngineInner {
    /// A message wins over a callback query in the same update; an inline
    /// query is routed on its own.
    pub(crate) async fn dispatch(self: &Arc<Self>, update: Update) -> Result<()> {
        if self.dispatcher.is_stopped() {
            return Err(Error::DispatcherStopped);
        }
        if let Err(e) = self.me().await {
            // The button press still has to be answered.
            if let (None, Some(query)) = (&update.message, &update.callback_query) {
                self.acknowledge_unhandled(&query.id).await;
            }
            error!(update_id = update.id, "dispatch failed: {e}");
            return Err(e);
        }

        let Update {
            id,
            message,
            callback_query,
            inline_query,
        } = update;

        let mut result = match (message, callback_query) {
            (Some(msg), _) => self.route_message(msg).await,
            (None, Some(query)) => self.route_callback_query(query).await,
            (None, None) => Ok(()),
        };
        if let Some(query) = inline_query {
            let routed = self.route_inline_query(query).await;
            if result.is_ok() {
                result = routed;
            }
        }

        match &result {
            Ok(()) => {}
            Err(e @ Error::Unroutable { .. }) => warn!(update_id = id, "{e}"),
            Err(e) => error!(update_id = id, "dispatch failed: {e}"),
        }
        result
    }

    async fn route_message(self: &Arc<Self>, msg: Message) -> Result<()> {
        let session = self.session_for(&msg.chat).await?;
        let chat_id = session.chat_id();
        let task =
            Task::new("message", async move { session.handle_message(&msg).await }).in_lane(chat_id);
        self.dispatcher.submit(task).await
    }

    async fn route_callback_query(self: &Arc<Self>, query: CallbackQuery) -> Result<()> {
        // Buttons on inline-mode messages carry no conversation.
        let Some(chat) = query.message.as_ref().map(|m| m.chat.clone()) else {
            self.acknowledge_unhandled(&query.id).await;
            return Ok(());
        };

        let session = match self.session_for(&chat).await {
            Ok(session) => session,
            Err(e) => {
                self.acknowledge_unhandled(&query.id).await;
                return Err(e);
            }
        };

        let callback_id = query.id.clone();
        let chat_id = session.chat_id();
        let task = Task::new("callback_query", async move {
            session.handle_callback_query(&query).await
        })
        .in_lane(chat_id);
        if let Err(e) = self.dispatcher.submit(task).await {
            self.acknowledge_unhandled(&callback_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn route_inline_query(&self, query: InlineQuery) -> Result<()> {
        let Some(handler) = self.inline_handler(&query.query) else {
            debug!(query = %query.query, "no inline-query handler matches");
            return Ok(());
        };

        let cx = self.inline_context(self.me().await?);
        let query_id = query.id.clone();
        let task = Task::new("inline_query", async move {
            if let Err(e) = handler(cx, query).await {
                error!(query_id = %query_id, "inline-query handler failed: {e:#}");
            }
        });
        self.dispatcher.submit(task).await
    }

    async fn acknowledge_unhandled(&self, callback_id: &str) {
        if let Err(e) = self.platform.answer_callback_query(callback_id, None).await {
            warn!(callback_id, "failed to acknowledge callback: {e}");
        }
    }

    /// The chat's live session, created (and its activation queued ahead of
    /// any other work) on first contact.
    pub(crate) async fn session_for(self: &Arc<Self>, chat: &Chat) -> Result<Arc<Session>> {
        if let Some(session) = self.table.acquire(chat.id).await {
            return Ok(session);
        }
        self.open_session(ChatInfo::from(chat), None).await
    }

    /// Get or create the session for `chat`. A new session starts from `state`
    /// when given, else from the store's record (persistent classes only).
    pub(crate) async fn open_session(
        self: &Arc<Self>,
        chat: ChatInfo,
        state: Option<serde_json::Value>,
    ) -> Result<Arc<Session>> {
        let me = self.me().await?;
        let (chat_id, kind) = (chat.id, chat.kind);

        let opened = self
            .table
            .get_or_create(chat_id, || async move {
                let Some(session) = self.build_session(chat, me, state).await? else {
                    return Ok(None);
                };
                // Queued before the session is published, so activation
                // precedes every other task in its lane.
                let session = Arc::new(session);
                self.schedule_activation(&session).await?;
                Ok(Some(session))
            })
            .await?;
        let Some((session, created)) = opened else {
            return Err(Error::Unroutable { chat_id, kind });
        };

        if created {
            debug!(chat_id = %chat_id, kind = %kind, class = %session.class_name(), "session created");
        }
        Ok(session)
    }

    async fn build_session(
        self: &Arc<Self>,
        chat: ChatInfo,
        me: BotIdentity,
        state: Option<serde_json::Value>,
    ) -> Result<Option<Session>> {
        let Some(class) = self.class_for(chat.kind) else {
            return Ok(None);
        };

        let mut state = state;
        if state.is_none() && class.is_persistent() {
            if let Some(store) = &self.store {
                match store.load(chat.id).await {
                    Ok(Some(record)) if record.class == class.name() => state = Some(record.state),
                    Ok(Some(record)) => warn!(
                        chat_id = %chat.id,
                        stored = %record.class,
                        current = %class.name(),
                        "ignoring persisted state written by another class"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(chat_id = %chat.id, "failed to load persisted session: {e}"),
                }
            }
        }

        let cx = SessionContext::new(chat, me, self.platform.clone(), Arc::downgrade(self));
        let handler = class.bind(&cx, state)?;
        Ok(Some(Session::new(cx, handler, self.store.clone())))
    }
}
