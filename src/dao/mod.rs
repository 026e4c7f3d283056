/// Durable storage for undelivered analytics events.
pub mod event_store;
/// Storage error types shared by store implementations.
pub mod storage;
