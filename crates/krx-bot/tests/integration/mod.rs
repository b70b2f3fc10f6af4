//! Integration tests for krx-bot.
//!
//! These tests run the whole application against an in-process quote
//! server and the scriptable broker:
//! - Stored sessions monitored and exited
//! - Watchlist entry followed by monitoring
//! - Shutdown of every monitor

pub mod common;
