//! hab-connect
//!
//! Client-side plumbing for reaching an openHAB server from a mobile or
//! desktop app.
//!
//! This library provides:
//! - Connection resolution across local, remote and cloud URLs
//! - Network-state tracking that re-resolves on every change
//! - HTTP clients with basic auth, bound to the resolved endpoint
//! - A voice-command relay that queues until a connection exists
//! - Linked page extraction from sitemap XML/JSON

pub mod bus;
pub mod config;
pub mod connection;
pub mod context;
pub mod model;
pub mod network;
pub mod voice;
