//! Library crate for cardsync, exposing the runtime for the headless binary, host integrations
//! and integration tests.

pub mod clock;
pub mod config;
/// Durable storage behind the analytics retry path.
pub mod dao;
pub mod dom;
/// Wire and storage payloads.
pub mod dto;
/// Error types of each layer.
pub mod error;
/// Connection, analytics, overrides, lifecycles and interaction.
pub mod services;
pub mod state;
