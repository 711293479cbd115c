#![forbid(unsafe_code)]

//! Wire codec for the collab server: tagged JSON envelopes carried as
//! WebSocket text frames.

mod wire;

pub use wire::{CodecError, DEFAULT_MAX_FRAME_SIZE, MessageKind, WireMessage};
