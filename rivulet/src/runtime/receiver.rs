//! Receiver thread runtime.
//!
//! Responsibilities:
//! - Apply conductor commands to the dispatcher.
//! - Poll receive channel endpoints and dispatch DATA and SETUP frames.
//! - Time out pending handshakes so DATA elicits SETUP again, unless an
//!   image has already been requested for them.
//! - End image cooldowns.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::media::{
    ConnectionState, DataPacketDispatcher, Image, PendingSetupRegistry, PublicationImage,
    ReceiveChannelEndpoint, SessionStreamKey,
};
use crate::net::Endpoint;
use crate::protocol::{Frame, SessionId, StreamId, decode_frame};
use crate::trace::{debug, info, trace, warn};

use super::ReceiverError;
use super::commands::{CommandConsumer, ConductorProxy, ImageRequestProducer, ReceiverCommand};

/// Largest datagram the receiver accepts.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Receiver tuning.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// How long a handshake may stay pending before DATA elicits SETUP again.
    pub pending_setup_timeout: Duration,
    /// How long a removed image's key ignores traffic.
    pub image_cool_down_timeout: Duration,
    /// Datagrams read from one endpoint per duty cycle.
    pub max_datagrams_per_poll: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            pending_setup_timeout: Duration::from_millis(100),
            image_cool_down_timeout: Duration::from_secs(10),
            max_datagrams_per_poll: 16,
        }
    }
}

struct PendingSetup<E> {
    endpoint: Arc<E>,
    registered_at: Instant,
}

/// Handshakes awaiting SETUP, one per key.
///
/// Registering a key again replaces its entry and restarts its timeout, so
/// a leftover registration from an earlier handshake cannot cut a newer one
/// short.
pub struct PendingSetups<E> {
    entries: HashMap<SessionStreamKey, PendingSetup<E>>,
    now: Instant,
}

impl<E> PendingSetups<E> {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            entries: HashMap::new(),
            now,
        }
    }

    /// Sets the timestamp given to registrations from here on.
    pub fn update_clock(&mut self, now: Instant) {
        self.now = now;
    }

    /// Removes and returns the entries registered at least `timeout` before
    /// `now`, with the endpoint each was registered on.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(SessionStreamKey, Arc<E>)> {
        let expired_keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.registered_at) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry.endpoint)))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, key: &SessionStreamKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> PendingSetupRegistry<E> for PendingSetups<E> {
    fn add_pending_setup_message(
        &mut self,
        session_id: SessionId,
        stream_id: StreamId,
        endpoint: Arc<E>,
    ) {
        self.entries.insert(
            SessionStreamKey::new(session_id, stream_id),
            PendingSetup {
                endpoint,
                registered_at: self.now,
            },
        );
    }
}

/// The dispatcher as wired up inside the receiver.
pub type ReceiverDispatcher = DataPacketDispatcher<
    Image,
    ConductorProxy<ReceiveChannelEndpoint>,
    PendingSetups<ReceiveChannelEndpoint>,
>;

/// Receiver thread state and duty cycle.
pub struct Receiver {
    config: ReceiverConfig,
    dispatcher: ReceiverDispatcher,
    commands: CommandConsumer,
    endpoints: Vec<Arc<ReceiveChannelEndpoint>>,
    /// Deadline of each key in cooldown.
    cool_downs: HashMap<SessionStreamKey, Instant>,
    /// Reusable buffer for receiving datagrams.
    recv_buf: Vec<u8>,
    running: bool,
}

impl Receiver {
    /// Creates a receiver.
    ///
    /// # Arguments
    ///
    /// * `commands` - SPSC consumer for conductor commands.
    /// * `image_requests` - SPSC producer for image requests to the conductor.
    #[must_use]
    pub fn new(
        config: ReceiverConfig,
        commands: CommandConsumer,
        image_requests: ImageRequestProducer,
    ) -> Self {
        let dispatcher = DataPacketDispatcher::new(
            ConductorProxy::new(image_requests),
            PendingSetups::new(Instant::now()),
        );
        Self {
            config,
            dispatcher,
            commands,
            endpoints: Vec::new(),
            cool_downs: HashMap::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            running: true,
        }
    }

    /// Runs the duty cycle until a `Shutdown` command arrives.
    pub fn run(&mut self) {
        while self.running {
            if self.do_work(Instant::now()) == 0 {
                thread::yield_now();
            }
        }
    }

    /// One duty cycle. Returns the amount of work done, 0 when idle.
    pub fn do_work(&mut self, now: Instant) -> usize {
        self.dispatcher.pending_setups_mut().update_clock(now);

        let mut work_count = self.process_commands(now);
        if !self.running {
            return work_count;
        }

        work_count += self.poll_endpoints();
        work_count += self.clear_dropped_requests();
        work_count += self.expire_pending_setups(now);
        work_count += self.expire_cool_downs(now);
        work_count
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn dispatcher(&self) -> &ReceiverDispatcher {
        &self.dispatcher
    }

    fn process_commands(&mut self, now: Instant) -> usize {
        let mut count = 0;
        while let Some(cmd) = self.commands.pop() {
            count += 1;
            match cmd {
                ReceiverCommand::AddEndpoint(endpoint) => {
                    info!(channel = %endpoint.channel(), "adding endpoint");
                    self.endpoints.push(endpoint);
                }
                ReceiverCommand::AddSubscription { stream_id } => {
                    self.dispatcher.add_subscription(stream_id);
                }
                ReceiverCommand::RemoveSubscription { stream_id } => {
                    self.dispatcher.remove_subscription(stream_id);
                }
                ReceiverCommand::NewPublicationImage(image) => {
                    let key = SessionStreamKey::new(image.session_id(), image.stream_id());
                    self.cool_downs.remove(&key);
                    self.dispatcher.add_publication_image(image);
                }
                ReceiverCommand::RemovePublicationImage(image) => {
                    let key = SessionStreamKey::new(image.session_id(), image.stream_id());
                    self.dispatcher.remove_publication_image(&image);
                    if self.dispatcher.state(key.session_id, key.stream_id)
                        == ConnectionState::CoolDown
                    {
                        self.cool_downs
                            .insert(key, now + self.config.image_cool_down_timeout);
                    }
                }
                ReceiverCommand::RemovePendingSetup {
                    session_id,
                    stream_id,
                } => {
                    self.dispatcher.remove_pending_setup(session_id, stream_id);
                }
                ReceiverCommand::RemoveCoolDown {
                    session_id,
                    stream_id,
                } => {
                    self.cool_downs
                        .remove(&SessionStreamKey::new(session_id, stream_id));
                    self.dispatcher.remove_cool_down(session_id, stream_id);
                }
                ReceiverCommand::Shutdown => {
                    info!("receiver shutdown requested");
                    self.running = false;
                    break;
                }
            }
        }
        count
    }

    fn poll_endpoints(&mut self) -> usize {
        let Self {
            config,
            dispatcher,
            endpoints,
            recv_buf,
            ..
        } = self;

        let mut received = 0;
        for endpoint in endpoints.iter() {
            for _ in 0..config.max_datagrams_per_poll {
                match endpoint.poll(recv_buf.as_mut_slice()) {
                    Ok(Some((len, source))) => {
                        received += 1;
                        dispatch(dispatcher, endpoint, &recv_buf[..len], source);
                    }
                    Ok(None) => break,
                    Err(_e) => {
                        warn!(channel = %endpoint.channel(), error = %_e, "receive failed");
                        break;
                    }
                }
            }
        }
        received
    }

    /// Clears handshakes that saw no SETUP in time.
    ///
    /// A handshake that already asked for an image is waiting on the
    /// conductor, not the sender; its timeout is restarted instead.
    fn expire_pending_setups(&mut self, now: Instant) -> usize {
        let expired = self
            .dispatcher
            .pending_setups_mut()
            .expire(now, self.config.pending_setup_timeout);
        let count = expired.len();

        for (key, endpoint) in expired {
            if self.dispatcher.is_image_requested(key.session_id, key.stream_id) {
                trace!(key = %key, "image creation in progress, re-arming pending setup");
                self.dispatcher.pending_setups_mut().add_pending_setup_message(
                    key.session_id,
                    key.stream_id,
                    endpoint,
                );
            } else {
                trace!(key = %key, "pending setup timed out");
                self.dispatcher
                    .remove_pending_setup(key.session_id, key.stream_id);
            }
        }
        count
    }

    /// Clears handshakes whose image request never reached the conductor.
    fn clear_dropped_requests(&mut self) -> usize {
        let dropped = self.dispatcher.image_creator_mut().take_dropped();
        for key in &dropped {
            debug!(key = %key, "image request dropped, clearing handshake");
            self.dispatcher
                .remove_pending_setup(key.session_id, key.stream_id);
        }
        dropped.len()
    }

    fn expire_cool_downs(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.cool_downs.retain(|key, deadline| {
            if *deadline <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        for key in &expired {
            self.dispatcher.remove_cool_down(key.session_id, key.stream_id);
        }
        expired.len()
    }
}

fn dispatch(
    dispatcher: &mut ReceiverDispatcher,
    endpoint: &Arc<ReceiveChannelEndpoint>,
    datagram: &[u8],
    source: Endpoint,
) {
    match decode_frame(datagram) {
        Ok(Frame::Data { header, frame }) => {
            dispatcher.on_data_packet(endpoint, &header, frame, source);
        }
        Ok(Frame::Setup(setup)) => {
            dispatcher.on_setup_message(endpoint, &setup, source);
        }
        Ok(_other) => {
            trace!(source = %source, frame = ?_other, "ignoring frame");
        }
        Err(_e) => {
            warn!(source = %source, len = datagram.len(), error = %_e, "dropping malformed datagram");
        }
    }
}

/// Runs `receiver` on a thread named `rivulet-receiver`.
///
/// # Errors
///
/// Returns [`ReceiverError::Spawn`] if the thread cannot be created.
pub fn spawn_receiver(mut receiver: Receiver) -> Result<JoinHandle<()>, ReceiverError> {
    debug!("spawning receiver thread");
    thread::Builder::new()
        .name("rivulet-receiver".into())
        .spawn(move || {
            info!("receiver thread started");
            receiver.run();
            info!("receiver thread exiting");
        })
        .map_err(ReceiverError::Spawn)
}
