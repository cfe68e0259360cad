//! Mesh Device Protocol Module
//!
//! This module contains the device-facing protocol layers:
//! - `framing`: stream framing over serial and TCP links
//! - `schema`: protobuf envelopes and application payloads
//! - `envelope`: `FromRadio` decoding and packet header extraction
//! - `message`: port table and typed application messages

pub mod envelope;
pub mod framing;
pub mod message;
pub mod schema;

// Re-export framing types
pub use framing::{encode_frame, decode_frame, StreamFramer, FramerStats, MAX_FRAME_PAYLOAD};

// Re-export envelope types
pub use envelope::{encode_to_radio, encode_from_radio, split_packet, Envelope, PacketHeader, PacketPayload};

// Re-export message types
pub use message::{AppMessage, AppPort};
