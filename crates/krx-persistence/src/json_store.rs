//! File-backed session store.
//!
//! The whole table is one JSON document. Every mutation writes a temp file
//! next to the target, syncs it and renames it over the target, so a crash
//! leaves either the old or the new table on disk, never a torn one. The
//! in-memory table only changes after the rename succeeds.

use crate::error::PersistenceResult;
use crate::store::{SessionStore, SessionTable};
use krx_core::{BoxFuture, Session, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: u64,
    sessions: Vec<Session>,
}

/// JSON document store for a single-host deployment.
#[derive(Debug)]
pub struct JsonFileSessionStore {
    path: PathBuf,
    table: Mutex<SessionTable>,
}

impl JsonFileSessionStore {
    /// Open the store at `path`, loading it if it exists.
    pub fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let table = if path.exists() {
            let bytes = fs::read(&path)?;
            let file: StoreFile = serde_json::from_slice(&bytes)?;
            let table = SessionTable::from_rows(file.next_id, file.sessions)?;
            info!(
                path = %path.display(),
                sessions = table.list_all().len(),
                "Loaded session store"
            );
            table
        } else {
            info!(path = %path.display(), "Creating empty session store");
            SessionTable::default()
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `op` to a copy of the table, persist the copy, then commit it.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut SessionTable) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        let out = op(&mut next)?;
        self.write_atomic(&next)?;
        *table = next;
        Ok(out)
    }

    fn write_atomic(&self, table: &SessionTable) -> PersistenceResult<()> {
        let doc = StoreFile {
            next_id: table.next_id(),
            sessions: table.list_all(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), sessions = doc.sessions.len(), "Persisted sessions");
        Ok(())
    }
}

impl SessionStore for JsonFileSessionStore {
    fn list_all(&self) -> BoxFuture<'_, PersistenceResult<Vec<Session>>> {
        Box::pin(async move { Ok(self.table.lock().list_all()) })
    }

    fn get(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<Option<Session>>> {
        Box::pin(async move { Ok(self.table.lock().get(id)) })
    }

    fn insert(&self, session: Session) -> BoxFuture<'_, PersistenceResult<Session>> {
        Box::pin(async move { self.mutate(|t| t.insert(session)) })
    }

    fn update(&self, session: Session) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move { self.mutate(|t| t.update(session)) })
    }

    fn delete(&self, id: SessionId) -> BoxFuture<'_, PersistenceResult<bool>> {
        Box::pin(async move { self.mutate(|t| Ok(t.delete(id))) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use krx_core::{Price, Ticker};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

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
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let id = {
            let store = JsonFileSessionStore::open(&path).unwrap();
            let mut s = store.insert(session("005930")).await.unwrap();
            s.apply_buy(12, Price::from_krw(71_000)).unwrap();
            store.update(s.clone()).await.unwrap();
            store.insert(session("000660")).await.unwrap();
            s.id
        };

        let store = JsonFileSessionStore::open(&path).unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.get(id).await.unwrap().unwrap().quantity, 12);

        // Ids keep increasing across reopen.
        let c = store.insert(session("035720")).await.unwrap();
        assert_eq!(c.id, SessionId(3));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        let store = JsonFileSessionStore::open(&path).unwrap();
        store.insert(session("005930")).await.unwrap();

        let names: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sessions.json".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_table_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        let store = JsonFileSessionStore::open(&path).unwrap();
        store.insert(session("005930")).await.unwrap();
        assert!(store.insert(session("005930")).await.is_err());

        let reopened = JsonFileSessionStore::open(&path).unwrap();
        assert_eq!(reopened.list_all().await.unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_corrupt_row() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        let mut s = session("005930");
        s.id = SessionId(1);
        s.spent_fund = dec!(5_000_000);
        let doc = StoreFile {
            next_id: 1,
            sessions: vec![s],
        };
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(JsonFileSessionStore::open(&path).is_err());
    }
}
