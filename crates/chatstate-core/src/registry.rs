//! Which handler class serves which conversation kind, and which handler
//! answers which inline-query prefix.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    context::InlineContext,
    domain::ChatKind,
    errors::{Error, HandlerResult},
    handler::{ClassBinding, HandlerClass, RegisteredClass},
    messaging::types::InlineQuery,
    Result,
};

#[derive(Default)]
pub struct HandlerRegistry {
    classes: HashMap<ChatKind, Arc<dyn ClassBinding>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class` for `kinds`. `ChatKind::Any` registers the class as the
    /// fallback for kinds without a class of their own.
    ///
    /// The class is resolved for every kind it may serve before anything is
    /// recorded, so a failed registration leaves the registry unchanged.
    pub fn register<H: Send + 'static>(
        &mut self,
        kinds: &[ChatKind],
        class: HandlerClass<H>,
    ) -> Result<()> {
        if kinds.is_empty() {
            return Err(Error::Config(format!(
                "handler class {} registered without a chat kind",
                class.name()
            )));
        }
        if kinds.contains(&ChatKind::Unbound) {
            return Err(Error::Config(format!(
                "handler class {} cannot be registered for kind none",
                class.name()
            )));
        }
        for kind in kinds {
            if let Some(existing) = self.classes.get(kind) {
                return Err(Error::DuplicateRegistration(format!(
                    "{kind} chats are already served by class {}",
                    existing.name()
                )));
            }
        }

        let served: Vec<ChatKind> = if kinds.contains(&ChatKind::Any) {
            ChatKind::CONCRETE.to_vec()
        } else {
            let mut served = kinds.to_vec();
            served.dedup();
            served
        };

        let name = class.name().to_string();
        let binding: Arc<dyn ClassBinding> = Arc::new(RegisteredClass::resolve(class, &served)?);
        for kind in kinds {
            self.classes.insert(*kind, binding.clone());
        }
        tracing::info!(class = %name, kinds = ?kinds, "handler class registered");
        Ok(())
    }

    /// Class serving `kind`: the specific registration, else the `Any` fallback.
    pub(crate) fn resolve(&self, kind: ChatKind) -> Option<Arc<dyn ClassBinding>> {
        if !kind.is_concrete() {
            return None;
        }
        self.classes
            .get(&kind)
            .or_else(|| self.classes.get(&ChatKind::Any))
            .cloned()
    }

    pub fn is_served(&self, kind: ChatKind) -> bool {
        self.resolve(kind).is_some()
    }

    pub fn class_name(&self, kind: ChatKind) -> Option<String> {
        self.resolve(kind).map(|c| c.name().to_string())
    }
}

pub type InlineQueryFn =
    Arc<dyn Fn(InlineContext, InlineQuery) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Inline-query handlers keyed by lowercase query prefix.
#[derive(Default)]
pub struct InlineQueryRegistry {
    handlers: Vec<(String, InlineQueryFn)>,
}

impl InlineQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prefix: &str, handler: InlineQueryFn) -> Result<()> {
        let prefix = prefix.to_lowercase();
        if self.handlers.iter().any(|(p, _)| *p == prefix) {
            return Err(Error::Config(format!(
                "inline-query prefix {prefix:?} is already registered"
            )));
        }
        self.handlers.push((prefix, handler));
        Ok(())
    }

    /// Handler with the longest prefix of `query`, compared case-insensitively.
    /// An empty prefix matches every query.
    pub fn resolve(&self, query: &str) -> Option<InlineQueryFn> {
        let query = query.to_lowercase();
        let mut best: Option<&(String, InlineQueryFn)> = None;
        for entry in &self.handlers {
            if !query.starts_with(entry.0.as_str()) {
                continue;
            }
            if best.map_or(true, |(p, _)| entry.0.len() > p.len()) {
                best = Some(entry);
            }
        }
        best.map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
