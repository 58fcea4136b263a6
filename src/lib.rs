// Public API for the binary and integration tests

pub mod api;
pub mod auth;
pub mod client;
pub mod completion;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod protocol;
pub mod router;
pub mod session;
pub mod types;
