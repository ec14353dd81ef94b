//! Concurrent map from chat id to live session.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, OwnedMutexGuard, RwLock},
    time::Instant,
};

use crate::{domain::ChatId, session::Session, Result};

/// Per-chat creation locks, so two updates racing for a new chat construct
/// exactly one session.
#[derive(Default)]
struct ChatLocks {
    inner: Mutex<HashMap<ChatId, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    async fn lock_chat(&self, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the chat's lock unless a caller still holds or awaits it; a
    /// second lock for the same chat would let two creators run at once.
    async fn forget(&self, chat_id: ChatId) {
        let mut map = self.inner.lock().await;
        if map.get(&chat_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&chat_id);
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ChatId, Arc<Session>>>,
    creation: ChatLocks,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&chat_id).cloned()
    }

    /// Look up a session for new work, refreshing its activity time under the
    /// table lock so a concurrent sweep cannot evict it in between.
    pub(crate) async fn acquire(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        let map = self.sessions.read().await;
        let session = map.get(&chat_id)?;
        session.touch();
        Some(session.clone())
    }

    /// Return the chat's session, building it with `create` if there is none.
    ///
    /// `create` runs at most once per chat at a time and before the result is
    /// visible to other callers; `Ok(None)` from it means the chat cannot be
    /// served and nothing is published. The flag is `true` when this call
    /// published a new session.
    pub async fn get_or_create<F, Fut>(
        &self,
        chat_id: ChatId,
        create: F,
    ) -> Result<Option<(Arc<Session>, bool)>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Arc<Session>>>>,
    {
        if let Some(session) = self.acquire(chat_id).await {
            return Ok(Some((session, false)));
        }

        let _creating = self.creation.lock_chat(chat_id).await;
        if let Some(session) = self.acquire(chat_id).await {
            return Ok(Some((session, false)));
        }

        let Some(session) = create().await? else {
            return Ok(None);
        };

        let mut map = self.sessions.write().await;
        let published = map.entry(chat_id).or_insert_with(|| session.clone()).clone();
        let created = Arc::ptr_eq(&published, &session);
        Ok(Some((published, created)))
    }

    /// Publish an already built session unless the chat has one.
    pub(crate) async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let chat_id = session.chat_id();
        let _creating = self.creation.lock_chat(chat_id).await;
        let mut map = self.sessions.write().await;
        if let Some(existing) = map.get(&chat_id) {
            return Some(existing.clone());
        }
        map.insert(chat_id, session);
        None
    }

    pub async fn remove(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&chat_id);
        if removed.is_some() {
            self.creation.forget(chat_id).await;
        }
        removed
    }

    /// Remove the chat's session only if it is the one with `session_id`.
    pub async fn remove_if_same(&self, chat_id: ChatId, session_id: u64) -> Option<Arc<Session>> {
        let mut map = self.sessions.write().await;
        if map.get(&chat_id)?.id() != session_id {
            return None;
        }
        let removed = map.remove(&chat_id);
        drop(map);

        self.creation.forget(chat_id).await;
        removed
    }

    /// Remove `session` only if it is still the chat's session and still idle.
    pub async fn remove_if_idle(
        &self,
        chat_id: ChatId,
        session: &Arc<Session>,
        timeout: Duration,
    ) -> bool {
        let mut map = self.sessions.write().await;
        let still_idle = map
            .get(&chat_id)
            .is_some_and(|current| Arc::ptr_eq(current, session) && is_idle(current, timeout));
        if !still_idle {
            return false;
        }
        map.remove(&chat_id);
        drop(map);

        self.creation.forget(chat_id).await;
        true
    }

    pub async fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for session in self.sessions.read().await.values() {
            f(session);
        }
    }

    /// Snapshot of every live session.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Sessions inactive for longer than `timeout`.
    pub async fn idle_candidates(&self, timeout: Duration) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| is_idle(s, timeout))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn is_idle(session: &Session, timeout: Duration) -> bool {
    session.idle_for(Instant::now()) > timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testing::{bare_session, group_chat, private_chat};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_builds_one_session() {
        let table = Arc::new(SessionTable::new());
        let built = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            let built = built.clone();
            tasks.push(tokio::spawn(async move {
                table
                    .get_or_create(ChatId(7), || async move {
                        built.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(Some(Arc::new(bare_session(&private_chat(7)))))
                    })
                    .await
                    .unwrap()
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap());
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(s, _)| Arc::ptr_eq(s, first)));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn unservable_chat_publishes_nothing() {
        let table = SessionTable::new();
        let out = table
            .get_or_create(ChatId(1), || async { Ok(None) })
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn remove_then_recreate_yields_new_instance() {
        let table = SessionTable::new();
        let (first, _) = table
            .get_or_create(ChatId(1), || async { Ok(Some(Arc::new(bare_session(&private_chat(1))))) })
            .await
            .unwrap()
            .unwrap();

        let removed = table.remove(ChatId(1)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(table.remove(ChatId(1)).await.is_none());

        let (second, created) = table
            .get_or_create(ChatId(1), || async { Ok(Some(Arc::new(bare_session(&private_chat(1))))) })
            .await
            .unwrap()
            .unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_candidates_and_conditional_removal() {
        let table = SessionTable::new();
        let timeout = Duration::from_secs(60);

        let quiet = Arc::new(bare_session(&group_chat(-1, "quiet")));
        assert!(table.insert(quiet.clone()).await.is_none());
        tokio::time::advance(Duration::from_secs(45)).await;

        let busy = Arc::new(bare_session(&private_chat(2)));
        assert!(table.insert(busy.clone()).await.is_none());
        tokio::time::advance(Duration::from_secs(30)).await;

        let idle = table.idle_candidates(timeout).await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].chat_id(), ChatId(-1));

        // Work arriving between the scan and the removal keeps it alive.
        assert!(table.acquire(ChatId(-1)).await.is_some());
        assert!(!table.remove_if_idle(ChatId(-1), &quiet, timeout).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(table.remove_if_idle(ChatId(-1), &quiet, timeout).await);
        assert!(table.get(ChatId(-1)).await.is_none());

        // A replaced session is never removed through a stale handle.
        let stale = busy.clone();
        table.remove(ChatId(2)).await;
        let fresh = Arc::new(bare_session(&private_chat(2)));
        table.insert(fresh).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!table.remove_if_idle(ChatId(2), &stale, timeout).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn forget_keeps_a_lock_that_is_still_in_use() {
        let locks = ChatLocks::default();
        let held = locks.lock_chat(ChatId(3)).await;

        locks.forget(ChatId(3)).await;
        assert_eq!(locks.tracked().await, 1);
        // Still the same lock, so a second creator has to wait.
        let waiting =
            tokio::time::timeout(Duration::from_millis(20), locks.lock_chat(ChatId(3))).await;
        assert!(waiting.is_err());

        drop(held);
        locks.forget(ChatId(3)).await;
        assert_eq!(locks.tracked().await, 0);
    }

    #[tokio::test]
    async fn remove_if_same_leaves_a_replacement_alone() {
        let table = SessionTable::new();
        let old = Arc::new(bare_session(&private_chat(4)));
        table.insert(old.clone()).await;
        table.remove(ChatId(4)).await;
        let fresh = Arc::new(bare_session(&private_chat(4)));
        table.insert(fresh.clone()).await;

        assert!(table.remove_if_same(ChatId(4), old.id()).await.is_none());
        assert!(Arc::ptr_eq(&table.get(ChatId(4)).await.unwrap(), &fresh));

        let removed = table.remove_if_same(ChatId(4), fresh.id()).await.unwrap();
        assert!(Arc::ptr_eq(&removed, &fresh));
        assert!(table.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn removal_racing_creation_never_builds_an_unpublished_session() {
        let table = Arc::new(SessionTable::new());
        let built = Arc::new(AtomicUsize::new(0));
        let published = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let mut tasks = Vec::new();
            for i in 0..6 {
                let table = table.clone();
                let built = built.clone();
                let published = published.clone();
                tasks.push(tokio::spawn(async move {
                    if i == 0 {
                        table.remove(ChatId(9)).await;
                        return;
                    }
                    let (_, created) = table
                        .get_or_create(ChatId(9), || async move {
                            built.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            Ok(Some(Arc::new(bare_session(&private_chat(9)))))
                        })
                        .await
                        .unwrap()
                        .unwrap();
                    if created {
                        published.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }
        }

        assert_eq!(
            built.load(Ordering::SeqCst),
            published.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn for_each_visits_every_session() {
        let table = SessionTable::new();
        for id in 1..=3 {
            table.insert(Arc::new(bare_session(&private_chat(id)))).await;
        }
        let mut seen = Vec::new();
        table.for_each(|s| seen.push(s.chat_id().0)).await;
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(table.all().await.len(), 3);
    }
}
