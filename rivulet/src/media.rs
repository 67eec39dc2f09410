//! Receive-side media: endpoints, publication images and the dispatcher that
//! routes inbound datagrams between them.
//!
//! - `types`: identity key and image status shared across threads.
//! - `endpoint`: UDP receive channel endpoint (sends setup-eliciting SMs).
//! - `image`: publication image with term buffers.
//! - `dispatcher`: per-(session, stream) connection state machine.

pub mod dispatcher;
pub mod endpoint;
pub mod image;
pub mod types;

pub use dispatcher::{
    ConnectionState, CreateImageRequest, DataPacketDispatcher, ImageCreator, PendingSetupRegistry,
};
pub use endpoint::{ChannelEndpoint, ChannelEndpointConfig, EndpointError, ReceiveChannelEndpoint};
pub use image::{Image, PublicationImage};
pub use types::{AtomicImageStatus, ImageStatus, SessionStreamKey};
