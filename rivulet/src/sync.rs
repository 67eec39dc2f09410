//! In-process queues connecting the receiver thread to its peers.

pub mod spsc;
