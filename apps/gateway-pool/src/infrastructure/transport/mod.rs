//! Gateway Transport Adapters
//!
//! Concrete [`Transport`](crate::application::ports::Transport)
//! implementations.
//!
//! - `json_lines`: newline-delimited JSON over TCP
//! - `frames`: the wire frames it speaks

pub mod frames;
mod json_lines;

pub use frames::{ClientFrame, FrameError, GatewayFrame};
pub use json_lines::JsonLinesTransport;
