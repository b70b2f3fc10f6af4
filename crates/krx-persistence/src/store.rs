//! Session store abstraction.
//!
//! The production store is a relational database owned by another team;
//! this crate only fixes the contract. One session per ticker: monitors and
//! locks are keyed by ticker, so a second open session for the same code is
//! refused at insert.

use crate::error::{PersistenceError, PersistenceResult};
use krx_core::{BoxFuture, Session, SessionId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// CRUD over persisted sessions.
///
/// Every call is atomic with respect to the others: a reader never sees a
/// half-applied update.
pub trait SessionStore: Send + Sync {
    /// All sessions ordered by id.
    fn list_all(&self) -> BoxFuture<'_, PersistenceResult<Vec<Session>>>;

    fn get(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<Option<Session>>>;

    /// Insert a new session. The store assigns the id and returns the
    /// stored record.
    fn insert(&self, session: Session) -> BoxFuture<'_, PersistenceResult<Session>>;

    /// Replace an existing session. `NotFound` if the id is unknown.
    fn update(&self, session: Session) -> BoxFuture<'_, PersistenceResult<()>>;

    /// Delete a session. Returns whether it existed.
    fn delete(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<bool>>;
}

/// Arc wrapper for SessionStore trait objects.
pub type DynSessionStore = Arc<dyn SessionStore>;

/// Id allocator plus rows. Shared by the in-memory and file-backed stores.
#[derive(Debug, Default, Clone)]
pub(crate) struct SessionTable {
    next_id: u64,
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionTable {
    pub(crate) fn list_all(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).cloned()
    }

    pub(crate) fn insert(&mut self, mut session: Session) -> PersistenceResult<Session> {
        session.validate()?;
        if self.sessions.values().any(|s| s.ticker == session.ticker) {
            return Err(PersistenceError::DuplicateTicker(session.ticker.to_string()));
        }
        self.next_id += 1;
        session.id = SessionId(self.next_id);
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub(crate) fn update(&mut self, session: Session) -> PersistenceResult<()> {
        session.validate()?;
        match self.sessions.get_mut(&session.id) {
            Some(slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(PersistenceError::NotFound(session.id)),
        }
    }

    pub(crate) fn delete(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Rebuild from persisted rows. Every row is validated and the id
    /// counter is kept ahead of the largest stored id.
    pub(crate) fn from_rows(next_id: u64, rows: Vec<Session>) -> PersistenceResult<Self> {
        let mut sessions = BTreeMap::new();
        for session in rows {
            session.validate()?;
            sessions.insert(session.id, session);
        }
        let max_id = sessions.keys().map(|id| id.0).max().unwrap_or(0);
        Ok(Self {
            next_id: next_id.max(max_id),
            sessions,
        })
    }
}

/// Volatile store for tests and paper trading.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    table: Mutex<SessionTable>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.table.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn list_all(&self) -> BoxFuture<'_, PersistenceResult<Vec<Session>>> {
        Box::pin(async move { Ok(self.table.lock().list_all()) })
    }

    fn get(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<Option<Session>>> {
        Box::pin(async move { Ok(self.table.lock().get(id)) })
    }

    fn insert(&self, session: Session) -> BoxFuture<'_, PersistenceResult<Session>> {
        Box::pin(async move { self.table.lock().insert(session) })
    }

    fn update(&self, session: Session) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move { self.table.lock().update(session) })
    }

    fn delete(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<bool>> {
        Box::pin(async move { Ok(self.table.lock().delete(id)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use krx_core::{Price, Ticker};
    use rust_decimal_macros::dec;

    fn session(ticker: &str) -> Session {
        Session::open(
            Ticker::from(ticker),
            "test",
            dec!(1_000_000),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            5,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = InMemorySessionStore::new();
        let a = store.insert(session("005930")).await.unwrap();
        let b = store.insert(session("000660")).await.unwrap();
        assert_eq!(a.id, SessionId(1));
        assert_eq!(b.id, SessionId(2));
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ticker_refused() {
        let store = InMemorySessionStore::new();
        store.insert(session("005930")).await.unwrap();
        let err = store.insert(session("005930")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::DuplicateTicker(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = InMemorySessionStore::new();
        let mut s = store.insert(session("005930")).await.unwrap();
        s.apply_buy(10, Price::from_krw(70_000)).unwrap();
        store.update(s.clone()).await.unwrap();
        assert_eq!(store.get(s.id).await.unwrap().unwrap().quantity, 10);

        assert!(store.delete(s.id).await.unwrap());
        assert!(!store.delete(s.id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = InMemorySessionStore::new();
        let mut s = session("005930");
        s.id = SessionId(42);
        assert!(matches!(
            store.update(s).await.unwrap_err(),
            PersistenceError::NotFound(SessionId(42))
        ));
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_row() {
        let store = InMemorySessionStore::new();
        let mut s = store.insert(session("005930")).await.unwrap();
        s.spent_fund = dec!(2_000_000);
        assert!(store.update(s.clone()).await.is_err());
        assert_eq!(store.get(s.id).await.unwrap().unwrap().spent_fund, dec!(0));
    }
}
