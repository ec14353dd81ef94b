//! Declarative handler classes.
//!
//! A handler class is a plain Rust type `H` plus a [`HandlerClass<H>`] table
//! listing which of its functions serve which capability, and in which kinds of
//! conversation. The table is resolved into one immutable
//! [`HandlerDescriptor<H>`] per conversation kind when the class is
//! registered, so conflicting declarations fail at startup.
//!
//! Handler functions are ordinary fns returning a boxed future:
//!
//! ```ignore
//! fn start<'a>(bot: &'a mut Echo, cx: &'a SessionContext, _msg: &'a Message)
//!     -> BoxFuture<'a, HandlerResult> {
//!     Box::pin(async move {
//!         bot.greeted = true;
//!         cx.send_text("hello").await?;
//!         Ok(())
//!     })
//! }
//! ```

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    context::SessionContext,
    domain::ChatKind,
    errors::{Error, HandlerResult},
    messaging::types::{CallbackQuery, Event, MediaKind, Message},
    Result,
};

pub type MessageFn<H> =
    for<'a> fn(&'a mut H, &'a SessionContext, &'a Message) -> BoxFuture<'a, HandlerResult>;

/// Callback-query handler; the returned text (if any) is shown to the user
/// when the query is acknowledged.
pub type CallbackFn<H> = for<'a> fn(
    &'a mut H,
    &'a SessionContext,
    &'a CallbackQuery,
) -> BoxFuture<'a, HandlerResult<Option<String>>>;

pub type EventFn<H> =
    for<'a> fn(&'a mut H, &'a SessionContext, &'a Event) -> BoxFuture<'a, HandlerResult>;

pub type HookFn<H> = for<'a> fn(&'a mut H, &'a SessionContext) -> BoxFuture<'a, HandlerResult>;

/// Idle check: `Ok(true)` keeps the session alive, `Ok(false)` allows eviction.
pub type IdleFn<H> =
    for<'a> fn(&'a mut H, &'a SessionContext) -> BoxFuture<'a, HandlerResult<bool>>;

pub type SnapshotFn<H> = fn(&H) -> HandlerResult<serde_json::Value>;
pub type RestoreFn<H> = fn(&SessionContext, serde_json::Value) -> HandlerResult<H>;

type Factory<H> = Box<dyn Fn(&SessionContext) -> H + Send + Sync>;

enum Capability<H> {
    Message(MessageFn<H>),
    Command(Vec<String>, MessageFn<H>),
    CallbackQuery(CallbackFn<H>),
    Event(String, EventFn<H>),
    Activate(HookFn<H>),
    Idle(IdleFn<H>),
    Stop(HookFn<H>),
    NewMember(MessageFn<H>),
    LeftMember(MessageFn<H>),
    Media(MediaKind, MessageFn<H>),
}

impl<H> Capability<H> {
    fn slot_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Command(..) => "command",
            Self::CallbackQuery(_) => "callback_query",
            Self::Event(..) => "event",
            Self::Activate(_) => "activate",
            Self::Idle(_) => "idle",
            Self::Stop(_) => "stop",
            Self::NewMember(_) => "new_member",
            Self::LeftMember(_) => "left_member",
            Self::Media(MediaKind::Document, _) => "document",
            Self::Media(MediaKind::Photo, _) => "photo",
            Self::Media(MediaKind::Video, _) => "video",
        }
    }
}

struct Entry<H> {
    kinds: Vec<ChatKind>,
    capability: Capability<H>,
}

impl<H> Entry<H> {
    fn applies_to(&self, kind: ChatKind) -> bool {
        self.kinds.iter().any(|k| *k == kind || *k == ChatKind::Any)
    }
}

/// Declarative table of a handler class: how to construct an instance and
/// which functions serve which capability in which conversation kinds.
pub struct HandlerClass<H> {
    name: String,
    factory: Factory<H>,
    persistence: Option<(SnapshotFn<H>, RestoreFn<H>)>,
    entries: Vec<Entry<H>>,
}

impl<H: Send + 'static> HandlerClass<H> {
    /// `factory` builds a fresh instance for every new session.
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn(&SessionContext) -> H + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            persistence: None,
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default handler for every message in the conversation.
    pub fn message(self, kinds: &[ChatKind], f: MessageFn<H>) -> Self {
        self.with(kinds, Capability::Message(f))
    }

    /// Command handler. Names may be given with or without the leading `/`;
    /// several aliases can share one handler.
    pub fn command(self, kinds: &[ChatKind], names: &[&str], f: MessageFn<H>) -> Self {
        let names = names.iter().map(|n| normalize_command(n)).collect();
        self.with(kinds, Capability::Command(names, f))
    }

    pub fn callback_query(self, kinds: &[ChatKind], f: CallbackFn<H>) -> Self {
        self.with(kinds, Capability::CallbackQuery(f))
    }

    /// Subscribe to a broadcast event. Several subscribers per event are
    /// allowed and run in declaration order.
    pub fn event(self, kinds: &[ChatKind], name: &str, f: EventFn<H>) -> Self {
        self.with(kinds, Capability::Event(name.to_string(), f))
    }

    pub fn activate(self, kinds: &[ChatKind], f: HookFn<H>) -> Self {
        self.with(kinds, Capability::Activate(f))
    }

    pub fn idle(self, kinds: &[ChatKind], f: IdleFn<H>) -> Self {
        self.with(kinds, Capability::Idle(f))
    }

    pub fn stop(self, kinds: &[ChatKind], f: HookFn<H>) -> Self {
        self.with(kinds, Capability::Stop(f))
    }

    pub fn new_member(self, kinds: &[ChatKind], f: MessageFn<H>) -> Self {
        self.with(kinds, Capability::NewMember(f))
    }

    pub fn left_member(self, kinds: &[ChatKind], f: MessageFn<H>) -> Self {
        self.with(kinds, Capability::LeftMember(f))
    }

    pub fn media(self, kinds: &[ChatKind], media: MediaKind, f: MessageFn<H>) -> Self {
        self.with(kinds, Capability::Media(media, f))
    }

    /// Persist instance state through the engine's session store using serde.
    pub fn persistent(self) -> Self
    where
        H: Serialize + DeserializeOwned,
    {
        self.persistent_with(snapshot_json::<H>, restore_json::<H>)
    }

    /// Persist instance state with custom conversion functions.
    pub fn persistent_with(mut self, snapshot: SnapshotFn<H>, restore: RestoreFn<H>) -> Self {
        self.persistence = Some((snapshot, restore));
        self
    }

    fn with(mut self, kinds: &[ChatKind], capability: Capability<H>) -> Self {
        self.entries.push(Entry {
            kinds: kinds.to_vec(),
            capability,
        });
        self
    }

    /// Resolve the table for one concrete conversation kind.
    pub fn describe(&self, kind: ChatKind) -> Result<HandlerDescriptor<H>> {
        if !kind.is_concrete() {
            return Err(Error::Config(format!(
                "handler class {} cannot be described for {kind} chats",
                self.name
            )));
        }

        let mut d = HandlerDescriptor::empty();
        for entry in &self.entries {
            if entry.kinds.is_empty() || entry.kinds.contains(&ChatKind::Unbound) {
                return Err(Error::Config(format!(
                    "{} handler in class {} must be bound to at least one chat kind",
                    entry.capability.slot_name(),
                    self.name
                )));
            }
            if !entry.applies_to(kind) {
                continue;
            }

            let slot = entry.capability.slot_name();
            match &entry.capability {
                Capability::Message(f) => self.claim(&mut d.message, *f, slot, kind)?,
                Capability::CallbackQuery(f) => self.claim(&mut d.callback_query, *f, slot, kind)?,
                Capability::Activate(f) => self.claim(&mut d.activate, *f, slot, kind)?,
                Capability::Idle(f) => self.claim(&mut d.idle, *f, slot, kind)?,
                Capability::Stop(f) => self.claim(&mut d.stop, *f, slot, kind)?,
                Capability::NewMember(f) => self.claim(&mut d.new_member, *f, slot, kind)?,
                Capability::LeftMember(f) => self.claim(&mut d.left_member, *f, slot, kind)?,
                Capability::Media(media, f) => {
                    if d.media.insert(*media, *f).is_some() {
                        return Err(self.conflict(slot, kind));
                    }
                }
                Capability::Command(names, f) => {
                    if names.is_empty() {
                        return Err(Error::Config(format!(
                            "command handler in class {} has no command names",
                            self.name
                        )));
                    }
                    for name in names {
                        if name.len() < 2 {
                            return Err(Error::Config(format!(
                                "empty command name in class {}",
                                self.name
                            )));
                        }
                        if d.commands.insert(name.clone(), *f).is_some() {
                            return Err(self.conflict(&format!("command {name}"), kind));
                        }
                    }
                }
                Capability::Event(name, f) => {
                    d.events.entry(name.clone()).or_default().push(*f);
                }
            }
        }
        Ok(d)
    }

    fn claim<F>(&self, slot: &mut Option<F>, f: F, what: &str, kind: ChatKind) -> Result<()> {
        if slot.is_some() {
            return Err(self.conflict(what, kind));
        }
        *slot = Some(f);
        Ok(())
    }

    fn conflict(&self, what: &str, kind: ChatKind) -> Error {
        Error::Config(format!(
            "class {} declares more than one {what} handler for {kind} chats",
            self.name
        ))
    }
}

/// Capabilities of one handler class in one conversation kind.
pub struct HandlerDescriptor<H> {
    message: Option<MessageFn<H>>,
    commands: HashMap<String, MessageFn<H>>,
    callback_query: Option<CallbackFn<H>>,
    events: HashMap<String, Vec<EventFn<H>>>,
    activate: Option<HookFn<H>>,
    idle: Option<IdleFn<H>>,
    stop: Option<HookFn<H>>,
    new_member: Option<MessageFn<H>>,
    left_member: Option<MessageFn<H>>,
    media: HashMap<MediaKind, MessageFn<H>>,
}

impl<H> HandlerDescriptor<H> {
    fn empty() -> Self {
        Self {
            message: None,
            commands: HashMap::new(),
            callback_query: None,
            events: HashMap::new(),
            activate: None,
            idle: None,
            stop: None,
            new_member: None,
            left_member: None,
            media: HashMap::new(),
        }
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(&normalize_command(name))
    }

    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn subscribers(&self, event: &str) -> usize {
        self.events.get(event).map(Vec::len).unwrap_or(0)
    }

    fn message_fn(&self, slot: &Slot) -> Option<MessageFn<H>> {
        match slot {
            Slot::Command(name) => self.commands.get(name).copied(),
            Slot::NewMember => self.new_member,
            Slot::LeftMember => self.left_member,
            Slot::Media(kind) => self.media.get(kind).copied(),
            Slot::Message => self.message,
        }
    }
}

/// One step of message handling, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Command(String),
    NewMember,
    LeftMember,
    Media(MediaKind),
    Message,
}

impl Slot {
    pub(crate) fn label(&self) -> String {
        match self {
            Self::Command(name) => format!("command {name}"),
            Self::NewMember => "new_member".to_string(),
            Self::LeftMember => "left_member".to_string(),
            Self::Media(MediaKind::Document) => "document".to_string(),
            Self::Media(MediaKind::Photo) => "photo".to_string(),
            Self::Media(MediaKind::Video) => "video".to_string(),
            Self::Message => "message".to_string(),
        }
    }
}

/// Type-erased handler instance bound to one session.
///
/// Every `call_*` returns `None` when the class declares nothing for that
/// capability in the session's conversation kind.
pub(crate) trait BoundHandler: Send {
    fn class_name(&self) -> &str;
    fn has_slot(&self, slot: &Slot) -> bool;
    fn subscribers(&self, event: &str) -> usize;
    fn is_persistent(&self) -> bool;

    fn call_message<'a>(
        &'a mut self,
        slot: &Slot,
        cx: &'a SessionContext,
        msg: &'a Message,
    ) -> Option<BoxFuture<'a, HandlerResult>>;

    fn call_callback_query<'a>(
        &'a mut self,
        cx: &'a SessionContext,
        query: &'a CallbackQuery,
    ) -> Option<BoxFuture<'a, HandlerResult<Option<String>>>>;

    fn call_event<'a>(
        &'a mut self,
        index: usize,
        cx: &'a SessionContext,
        event: &'a Event,
    ) -> Option<BoxFuture<'a, HandlerResult>>;

    fn call_activate<'a>(&'a mut self, cx: &'a SessionContext)
        -> Option<BoxFuture<'a, HandlerResult>>;

    fn call_idle<'a>(&'a mut self, cx: &'a SessionContext)
        -> Option<BoxFuture<'a, HandlerResult<bool>>>;

    fn call_stop<'a>(&'a mut self, cx: &'a SessionContext) -> Option<BoxFuture<'a, HandlerResult>>;

    /// Serialized instance state, for persistent classes.
    fn snapshot(&self) -> Option<HandlerResult<serde_json::Value>>;
}

struct Bound<H> {
    instance: H,
    descriptor: Arc<HandlerDescriptor<H>>,
    class_name: Arc<str>,
    snapshot: Option<SnapshotFn<H>>,
}

impl<H: Send + 'static> BoundHandler for Bound<H> {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn has_slot(&self, slot: &Slot) -> bool {
        self.descriptor.message_fn(slot).is_some()
    }

    fn subscribers(&self, event: &str) -> usize {
        self.descriptor.subscribers(event)
    }

    fn is_persistent(&self) -> bool {
        self.snapshot.is_some()
    }

    fn call_message<'a>(
        &'a mut self,
        slot: &Slot,
        cx: &'a SessionContext,
        msg: &'a Message,
    ) -> Option<BoxFuture<'a, HandlerResult>> {
        let f = self.descriptor.message_fn(slot)?;
        Some(f(&mut self.instance, cx, msg))
    }

    fn call_callback_query<'a>(
        &'a mut self,
        cx: &'a SessionContext,
        query: &'a CallbackQuery,
    ) -> Option<BoxFuture<'a, HandlerResult<Option<String>>>> {
        let f = self.descriptor.callback_query?;
        Some(f(&mut self.instance, cx, query))
    }

    fn call_event<'a>(
        &'a mut self,
        index: usize,
        cx: &'a SessionContext,
        event: &'a Event,
    ) -> Option<BoxFuture<'a, HandlerResult>> {
        let f = *self.descriptor.events.get(&event.name)?.get(index)?;
        Some(f(&mut self.instance, cx, event))
    }

    fn call_activate<'a>(
        &'a mut self,
        cx: &'a SessionContext,
    ) -> Option<BoxFuture<'a, HandlerResult>> {
        let f = self.descriptor.activate?;
        Some(f(&mut self.instance, cx))
    }

    fn call_idle<'a>(
        &'a mut self,
        cx: &'a SessionContext,
    ) -> Option<BoxFuture<'a, HandlerResult<bool>>> {
        let f = self.descriptor.idle?;
        Some(f(&mut self.instance, cx))
    }

    fn call_stop<'a>(&'a mut self, cx: &'a SessionContext) -> Option<BoxFuture<'a, HandlerResult>> {
        let f = self.descriptor.stop?;
        Some(f(&mut self.instance, cx))
    }

    fn snapshot(&self) -> Option<HandlerResult<serde_json::Value>> {
        self.snapshot.map(|f| f(&self.instance))
    }
}

/// A registered class with its descriptors resolved per conversation kind.
pub(crate) trait ClassBinding: Send + Sync {
    fn name(&self) -> &str;
    fn is_persistent(&self) -> bool;

    /// Build the handler instance for a new session, from `restored` state when
    /// given and readable.
    fn bind(
        &self,
        cx: &SessionContext,
        restored: Option<serde_json::Value>,
    ) -> Result<Box<dyn BoundHandler>>;
}

pub(crate) struct RegisteredClass<H> {
    name: Arc<str>,
    factory: Factory<H>,
    persistence: Option<(SnapshotFn<H>, RestoreFn<H>)>,
    descriptors: HashMap<ChatKind, Arc<HandlerDescriptor<H>>>,
}

impl<H: Send + 'static> RegisteredClass<H> {
    /// Resolve `class` for every kind in `kinds`; any conflict aborts.
    pub(crate) fn resolve(class: HandlerClass<H>, kinds: &[ChatKind]) -> Result<Self> {
        let mut descriptors = HashMap::new();
        for kind in kinds {
            descriptors.insert(*kind, Arc::new(class.describe(*kind)?));
        }
        Ok(Self {
            name: Arc::from(class.name.as_str()),
            factory: class.factory,
            persistence: class.persistence,
            descriptors,
        })
    }
}

impl<H: Send + 'static> ClassBinding for RegisteredClass<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    fn bind(
        &self,
        cx: &SessionContext,
        restored: Option<serde_json::Value>,
    ) -> Result<Box<dyn BoundHandler>> {
        let descriptor = self.descriptors.get(&cx.kind()).cloned().ok_or_else(|| {
            Error::Config(format!(
                "class {} has no descriptor for {} chats",
                self.name,
                cx.kind()
            ))
        })?;

        let instance = match (restored, self.persistence) {
            (Some(state), Some((_, restore))) => match restore(cx, state) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(
                        chat_id = %cx.chat_id(),
                        class = %self.name,
                        "discarding unreadable persisted state: {e:#}"
                    );
                    (self.factory)(cx)
                }
            },
            _ => (self.factory)(cx),
        };

        Ok(Box::new(Bound {
            instance,
            descriptor,
            class_name: self.name.clone(),
            snapshot: self.persistence.map(|(snapshot, _)| snapshot),
        }))
    }
}

/// `start` and `/start` name the same command.
pub fn normalize_command(name: &str) -> String {
    let name = name.trim();
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn snapshot_json<H: Serialize>(instance: &H) -> HandlerResult<serde_json::Value> {
    Ok(serde_json::to_value(instance)?)
}

fn restore_json<H: DeserializeOwned>(
    _cx: &SessionContext,
    state: serde_json::Value,
) -> HandlerResult<H> {
    Ok(serde_json::from_value(state)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatKind::*;

    #[derive(Default)]
    struct Spy {
        calls: Vec<&'static str>,
    }

    fn on_text<'a>(p: &'a mut Spy, _: &'a SessionContext, _: &'a Message) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            p.calls.push("text");
            Ok(())
        })
    }

    fn on_other_text<'a>(
        p: &'a mut Spy,
        _: &'a SessionContext,
        _: &'a Message,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            p.calls.push("other");
            Ok(())
        })
    }

    fn on_tick<'a>(p: &'a mut Spy, _: &'a SessionContext, _: &'a Event) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            p.calls.push("tick");
            Ok(())
        })
    }

    fn keep<'a>(_: &'a mut Spy, _: &'a SessionContext) -> BoxFuture<'a, HandlerResult<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn class() -> HandlerClass<Spy> {
        HandlerClass::new("spy", |_| Spy::default())
    }

    #[test]
    fn command_names_are_normalized_with_aliases() {
        let d = class()
            .command(&[Private], &["start", "/begin"], on_text)
            .describe(Private)
            .unwrap();
        assert_eq!(d.command_names(), vec!["/begin", "/start"]);
        assert!(d.has_command("/start"));
        assert!(d.has_command("start"));
        assert!(!d.has_command("stop"));
    }

    #[test]
    fn entries_apply_only_to_their_kinds() {
        let c = class()
            .message(&[Private], on_text)
            .message(&[Group], on_other_text)
            .idle(&[Any], keep);

        let private = c.describe(Private).unwrap();
        let group = c.describe(Group).unwrap();
        let channel = c.describe(Channel).unwrap();

        assert!(private.message.is_some());
        assert!(group.message.is_some());
        assert!(channel.message.is_none());
        assert!(channel.idle.is_some());
    }

    #[test]
    fn two_default_handlers_for_one_kind_conflict() {
        let c = class()
            .message(&[Private], on_text)
            .message(&[Any], on_other_text);
        let err = c.describe(Private).err().unwrap();
        assert!(matches!(err, Error::Config(ref m) if m.contains("message")));
        // Group chats only see the wildcard handler.
        assert!(c.describe(Group).is_ok());
    }

    #[test]
    fn duplicate_command_names_conflict() {
        let c = class()
            .command(&[Any], &["/help"], on_text)
            .command(&[Private], &["help"], on_other_text);
        assert!(matches!(c.describe(Private), Err(Error::Config(_))));
        assert!(c.describe(Group).is_ok());
    }

    #[test]
    fn media_slots_are_exclusive_per_media_kind() {
        let c = class()
            .media(&[Private], MediaKind::Photo, on_text)
            .media(&[Private], MediaKind::Video, on_text);
        assert!(c.describe(Private).is_ok());

        let c = c.media(&[Any], MediaKind::Photo, on_other_text);
        assert!(matches!(c.describe(Private), Err(Error::Config(_))));
    }

    #[test]
    fn events_keep_every_subscriber_in_order() {
        let d = class()
            .event(&[Private], "tick", on_tick)
            .event(&[Any], "tick", on_tick)
            .describe(Private)
            .unwrap();
        assert_eq!(d.subscribers("tick"), 2);
        assert_eq!(d.subscribers("tock"), 0);
    }

    #[test]
    fn unbound_entries_are_rejected() {
        let c = class().message(&[Unbound], on_text);
        assert!(matches!(c.describe(Private), Err(Error::Config(_))));
        let c = class().message(&[], on_text);
        assert!(matches!(c.describe(Private), Err(Error::Config(_))));
    }

    #[test]
    fn wildcard_kind_cannot_be_described() {
        assert!(matches!(class().describe(Any), Err(Error::Config(_))));
    }
}
