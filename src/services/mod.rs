//! Server-side services: the relay room registry and the snapshot store.

pub mod room;
pub mod store;
