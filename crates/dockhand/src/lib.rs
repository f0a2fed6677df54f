//! Dockhand
//!
//! Real-time control channel for a Docker/Podman engine: clients connect over
//! a WebSocket, send typed request envelopes, and receive progress, results
//! and state changes while a synchronizer keeps a SQLite mirror of the
//! engine's containers.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod ops;
pub mod registry;
pub mod settings;
pub mod sync;
pub mod templates;
pub mod ws;
