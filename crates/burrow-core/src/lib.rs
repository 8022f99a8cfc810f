//! burrow-core — wire format, frame crypto, and shared types for the
//! burrow durable-transport core.
//!
//! The session machinery lives in burrow-session; everything it puts on
//! the wire, and every knob it exposes, is defined here.

pub mod config;
pub mod frame;
pub mod keys;
pub mod mailbox;
pub mod record;

pub use config::DilationConfig;
pub use frame::{FrameBuffer, FrameCipher, FrameError};
pub use keys::{Role, SessionKeys};
pub use record::{Record, SubchannelId, CONTROL_CHANNEL_ID};
