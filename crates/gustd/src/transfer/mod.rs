//! Per-chunk transfer state machines.
//!
//! A transfer moves exactly one chunk between two peers. The receiver
//! side (`receive`) owns an ephemeral socket and drives the download of
//! one chunk; the sender side (`send`) answers OpenConnection requests
//! arriving on the daemon's main socket and streams the chunk back under
//! a sliding ack window. Lost packets are not retransmitted — the
//! receiver's read deadline fires and the whole chunk is retried by the
//! orchestrator.

pub mod receive;
pub mod send;

pub use receive::{fetch_chunk, TransferError};
pub use send::{SenderEvent, SenderTransfer};
