//! # murmur-store
//!
//! Local storage for the Murmur node, backed by SQLite (SQLCipher with the
//! `sqlcipher` feature).
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`, typed CRUD helpers per table, and the
//! [`murmur_net::Storage`] implementation the node manager drives.

pub mod avatars;
pub mod contacts;
pub mod database;
pub mod files;
pub mod identity;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;
mod storage;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
