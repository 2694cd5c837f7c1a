//! Receive/transmit core for an FEC-protected digital FPV video
//! ground-station link: session-keyed AEAD, Reed-Solomon block assembly,
//! RTP reordering, stream dispatch, and the adaptive-link control loop.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fec;
pub mod link;
pub mod orchestrator;
pub mod radio;
pub mod reorder;
pub mod spsc;
pub mod wire;

pub use crate::crypto::KeyMaterial;
