//! OA Upload Server Library
//!
//! Resumable chunked uploads: sessions, chunk ingestion with digest checks,
//! ordered reassembly and expiration of abandoned sessions.
//! The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Session lifecycle, chunk storage and artifact assembly
//! - `db`: SQLite-backed session store and chunk index
//! - `routes`: HTTP endpoints
//! - `config`: Environment configuration

pub mod config;
pub mod db;
pub mod routes;
pub mod state;
pub mod upload;
