//! Queues and messages between the receiver thread and its peers.
//!
//! Command flows:
//! - Conductor → Receiver: endpoints, subscriptions, images and timeouts
//! - Receiver → Conductor: requests to create publication images

use std::sync::Arc;

use crate::media::{
    CreateImageRequest, Image, ImageCreator, ReceiveChannelEndpoint, SessionStreamKey,
};
use crate::protocol::{SessionId, StreamId};
use crate::sync::spsc::{Consumer, Producer};
use crate::trace::{trace, warn};

/// Capacity of the command queue into the receiver.
///
/// Carries control-plane updates only, sized for bursts of subscription and
/// image changes.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the image request queue out of the receiver.
pub const IMAGE_REQUEST_QUEUE_CAPACITY: usize = 64;

pub type CommandProducer = Producer<ReceiverCommand, COMMAND_QUEUE_CAPACITY>;
pub type CommandConsumer = Consumer<ReceiverCommand, COMMAND_QUEUE_CAPACITY>;

pub type ImageRequest = CreateImageRequest<ReceiveChannelEndpoint>;
pub type ImageRequestProducer = Producer<ImageRequest, IMAGE_REQUEST_QUEUE_CAPACITY>;
pub type ImageRequestConsumer = Consumer<ImageRequest, IMAGE_REQUEST_QUEUE_CAPACITY>;

/// Commands applied by the receiver thread between polls.
#[derive(Debug)]
pub enum ReceiverCommand {
    /// Start polling an endpoint.
    AddEndpoint(Arc<ReceiveChannelEndpoint>),
    AddSubscription { stream_id: StreamId },
    RemoveSubscription { stream_id: StreamId },
    /// An image built for an earlier [`CreateImageRequest`].
    NewPublicationImage(Arc<Image>),
    /// Deactivate an image and start its cooldown.
    RemovePublicationImage(Arc<Image>),
    RemovePendingSetup {
        session_id: SessionId,
        stream_id: StreamId,
    },
    RemoveCoolDown {
        session_id: SessionId,
        stream_id: StreamId,
    },
    /// Exit the run loop.
    Shutdown,
}

/// Forwards image creation requests to the conductor thread.
///
/// Never blocks: if the queue is full the request is dropped and its key is
/// remembered, so the receiver can clear the handshake and let the sender's
/// next SETUP ask again.
pub struct ConductorProxy<E: Send + Sync> {
    requests: Producer<CreateImageRequest<E>, IMAGE_REQUEST_QUEUE_CAPACITY>,
    dropped: Vec<SessionStreamKey>,
}

impl<E: Send + Sync> ConductorProxy<E> {
    pub fn new(requests: Producer<CreateImageRequest<E>, IMAGE_REQUEST_QUEUE_CAPACITY>) -> Self {
        Self {
            requests,
            dropped: Vec::new(),
        }
    }

    /// Keys whose request did not fit the queue since the last call.
    pub fn take_dropped(&mut self) -> Vec<SessionStreamKey> {
        std::mem::take(&mut self.dropped)
    }
}

impl<E: Send + Sync> ImageCreator<E> for ConductorProxy<E> {
    fn create_publication_image(&mut self, request: CreateImageRequest<E>) {
        let key = SessionStreamKey::new(request.session_id, request.stream_id);
        match self.requests.push(request) {
            Ok(()) => {
                trace!(key = %key, "image request queued");
            }
            Err(_) => {
                warn!(key = %key, "conductor queue full, image request dropped");
                self.dropped.push(key);
            }
        }
    }
}
