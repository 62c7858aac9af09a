//! Per-channel reliability state.
//!
//! A connection owns one sender and one receiver per user message type it has
//! used, created lazily and indexed by `MessageType::channel_index`.

mod receiver;
mod sender;

pub use receiver::{ReceiverChannel, Received};
pub use sender::{AckResult, QueuedMessage, ReceiptTracker, SenderChannel, Transmission};
