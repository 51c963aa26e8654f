//! SSH honeypot
//!
//! Impersonates an SSH server, rejects every login, and keeps a record of each
//! connection: source address, client identification, the username/password
//! pairs it tried, and where in the world it came from.
//! - Bounded task-per-connection capture with graceful shutdown
//! - JSON-lines or SQLite event storage, plus log-to-SQLite migration
//! - Cached IP geolocation
//! - Prometheus gauges over the stored events

pub mod auth;
pub mod config;
pub mod db;
pub mod gate;
pub mod geoip;
pub mod handlers;
pub mod metrics;
pub mod web;
