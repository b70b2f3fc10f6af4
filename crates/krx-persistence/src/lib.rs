//! Session store and trade journal for the KRX slot trader.
//!
//! - `SessionStore`: CRUD over persisted sessions (trait; in-memory and
//!   JSON-file implementations)
//! - `TradeJournal`: append-only JSON Lines record of every execution

pub mod error;
pub mod journal;
pub mod json_store;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use journal::{TradeJournal, TradeRecord};
pub use json_store::JsonFileSessionStore;
pub use store::{DynSessionStore, InMemorySessionStore, SessionStore};
