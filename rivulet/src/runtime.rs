//! Receiver runtime: the thread that owns the dispatcher.
//!
//! # Architecture
//!
//! ```text
//!   conductor ──ReceiverCommand──> receiver ──CreateImageRequest──> conductor
//!                                     │
//!                       poll endpoints, decode, dispatch
//! ```
//!
//! The receiver never blocks. It drains its command queue, reads a bounded
//! number of datagrams from each endpoint, then runs its timers: pending
//! handshakes that saw no SETUP are cleared so DATA elicits it again, and
//! cooldowns of removed images end.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rivulet::media::{ChannelEndpointConfig, ReceiveChannelEndpoint};
//! use rivulet::net::Endpoint;
//! use rivulet::protocol::StreamId;
//! use rivulet::runtime::{self, Receiver, ReceiverCommand, ReceiverConfig};
//! use rivulet::sync::spsc;
//!
//! let (commands, command_rx) = spsc::channel::<_, { runtime::COMMAND_QUEUE_CAPACITY }>();
//! let (request_tx, requests) = spsc::channel::<_, { runtime::IMAGE_REQUEST_QUEUE_CAPACITY }>();
//! let handle = runtime::spawn_receiver(Receiver::new(
//!     ReceiverConfig::default(),
//!     command_rx,
//!     request_tx,
//! ))?;
//!
//! let endpoint = ReceiveChannelEndpoint::open(&ChannelEndpointConfig {
//!     bind: Endpoint::any(40123),
//!     ..ChannelEndpointConfig::default()
//! })?;
//! let _ = commands.push(ReceiverCommand::AddEndpoint(Arc::new(endpoint)));
//! let _ = commands.push(ReceiverCommand::AddSubscription { stream_id: StreamId::new(10) });
//!
//! // ... build images for whatever arrives on `requests` ...
//! # let _ = requests.pop();
//!
//! let _ = commands.push(ReceiverCommand::Shutdown);
//! let _ = handle.join();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod commands;
mod receiver;

use std::io;

use crate::media::EndpointError;

pub use commands::{
    COMMAND_QUEUE_CAPACITY, CommandConsumer, CommandProducer, ConductorProxy,
    IMAGE_REQUEST_QUEUE_CAPACITY, ImageRequest, ImageRequestConsumer, ImageRequestProducer,
    ReceiverCommand,
};
pub use receiver::{PendingSetups, Receiver, ReceiverConfig, ReceiverDispatcher, spawn_receiver};

/// Errors starting the receiver.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
