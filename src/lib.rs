//! Encrypted collaborative whiteboard: the client sync core and the server
//! that persists ciphertext and relays frames between peers.

pub mod api;
pub mod client;
pub mod config;
pub mod crypto;
pub mod frame;
pub mod routes;
pub mod services;
pub mod share;
pub mod state;
