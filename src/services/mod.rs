/// Batched engagement analytics with durable retry.
pub mod analytics;
/// Auto-reconnecting push connection and its local event bus.
pub mod connection;
/// First reveal of tagged cards.
pub mod discovery;
/// Typed topic publish/subscribe.
pub mod event_bus;
/// Pointer and touch handling on revealed cards.
pub mod interaction;
/// Video playback and readiness.
pub mod media;
/// Promotion and experiment override managers.
pub mod overrides;
/// Asset precedence rules.
pub mod resolution;
/// Push transport abstraction and its WebSocket and in-memory implementations.
pub mod transport;
/// In-place refresh of revealed cards.
pub mod update;
