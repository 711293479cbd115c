#![forbid(unsafe_code)]

//! Real-time collaborative editing server: rooms of authenticated clients
//! sharing one document snapshot and a chat stream over WebSocket, with a
//! single-writer hub mediating every message.

pub mod config;
pub mod server;
