//! taskbridge — links a git webhook stream to a task board.
//!
//! A push whose commit message references an open task's title completes that
//! task, records the commit, and fans both updates out to live project
//! viewers over WebSocket. Pipeline for one delivery:
//! verify signature → normalize payload → match task → reconcile → broadcast.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod matcher;
pub mod models;
pub mod payload;
pub mod reconcile;
pub mod server;
pub mod signature;
pub mod store;
