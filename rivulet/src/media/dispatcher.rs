//! Per-(session, stream) dispatch of inbound DATA and SETUP frames.
//!
//! Each key is in exactly one of four states:
//!
//! ```text
//!   Unknown ──DATA──> PendingSetup ──image added──> Connected
//!      ^                   │                            │
//!      │          remove_pending_setup            image removed
//!      │                   v                            v
//!      └───────────────── Unknown <──remove_cool_down── CoolDown
//! ```
//!
//! Unknown is the absence of an entry. The other three live in a single map,
//! so an image, a pending handshake and a cooldown can never coexist for the
//! same key.
//!
//! The dispatcher is owned by the receiver thread and never blocks. Every
//! outbound action goes through a fire-and-forget collaborator, and at most
//! one action is taken per datagram. Handshake traffic is latched: a key gets
//! one setup-eliciting status message and one image-creation request until
//! the owner clears the pending entry.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::net::Endpoint;
use crate::protocol::{DataHeader, SessionId, SetupHeader, StreamId};
use crate::trace::{debug, trace, warn};

use super::endpoint::ChannelEndpoint;
use super::image::PublicationImage;
use super::types::SessionStreamKey;

/// Receives requests to build a new publication image.
///
/// Implemented by the proxy that forwards to the conductor thread. The call
/// must not block and returns nothing; the image arrives later through
/// [`DataPacketDispatcher::add_publication_image`].
pub trait ImageCreator<E> {
    fn create_publication_image(&mut self, request: CreateImageRequest<E>);
}

/// Tracks handshakes that were elicited but have not produced an image yet.
///
/// The owner of the registry times these out and answers with
/// [`DataPacketDispatcher::remove_pending_setup`].
pub trait PendingSetupRegistry<E> {
    fn add_pending_setup_message(
        &mut self,
        session_id: SessionId,
        stream_id: StreamId,
        endpoint: Arc<E>,
    );
}

/// Everything the conductor needs to build an image for a SETUP.
#[derive(Debug)]
pub struct CreateImageRequest<E> {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_offset: i32,
    pub term_length: u32,
    pub mtu: u32,
    /// Where status messages and NAKs for the image should go.
    pub control_address: Endpoint,
    /// Where the SETUP came from.
    pub source_address: Endpoint,
    /// Endpoint the SETUP arrived on.
    pub endpoint: Arc<E>,
}

/// Externally visible state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing known about the key.
    Unknown,
    /// Handshake under way, no image yet.
    PendingSetup,
    /// DATA is forwarded to an image.
    Connected,
    /// An image was removed; traffic is ignored until the cooldown is cleared.
    CoolDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::PendingSetup => "pending-setup",
            Self::Connected => "connected",
            Self::CoolDown => "cool-down",
        };
        f.write_str(name)
    }
}

/// One-shot latches for a handshake in progress.
#[derive(Debug, Default, Clone, Copy)]
struct PendingConnection {
    setup_elicited: bool,
    image_requested: bool,
}

enum SessionState<I> {
    Pending(PendingConnection),
    Connected(Arc<I>),
    CoolDown,
}

impl<I> SessionState<I> {
    fn pending() -> Self {
        Self::Pending(PendingConnection::default())
    }

    const fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Pending(_) => ConnectionState::PendingSetup,
            Self::Connected(_) => ConnectionState::Connected,
            Self::CoolDown => ConnectionState::CoolDown,
        }
    }
}

/// Routes DATA to images and drives image establishment for everything else.
///
/// `I` is the image type, `C` the conductor proxy and `R` the pending-setup
/// registry. The channel endpoint type is chosen per call.
pub struct DataPacketDispatcher<I, C, R> {
    subscriptions: HashSet<StreamId>,
    sessions: HashMap<SessionStreamKey, SessionState<I>>,
    image_creator: C,
    pending_setups: R,
}

impl<I, C, R> DataPacketDispatcher<I, C, R>
where
    I: PublicationImage,
{
    pub fn new(image_creator: C, pending_setups: R) -> Self {
        Self {
            subscriptions: HashSet::new(),
            sessions: HashMap::new(),
            image_creator,
            pending_setups,
        }
    }

    /// Registers interest in a stream. Idempotent.
    pub fn add_subscription(&mut self, stream_id: StreamId) {
        if self.subscriptions.insert(stream_id) {
            debug!(stream_id = %stream_id, "subscription added");
        }
    }

    /// Drops interest in a stream and deactivates its images.
    ///
    /// Images stay in the directory; [`remove_publication_image`] removes
    /// them. Pending handshakes for the stream are discarded.
    ///
    /// [`remove_publication_image`]: Self::remove_publication_image
    pub fn remove_subscription(&mut self, stream_id: StreamId) {
        if !self.subscriptions.remove(&stream_id) {
            return;
        }
        debug!(stream_id = %stream_id, "subscription removed");

        self.sessions.retain(|key, state| {
            if key.stream_id != stream_id {
                return true;
            }
            match state {
                SessionState::Connected(image) => {
                    image.if_active_go_inactive();
                    true
                }
                SessionState::Pending(_) => false,
                SessionState::CoolDown => true,
            }
        });
    }

    /// Installs an image for its (session, stream) key.
    ///
    /// Whatever the key held before is replaced, including a pending
    /// handshake or a cooldown.
    pub fn add_publication_image(&mut self, image: Arc<I>) {
        let key = SessionStreamKey::new(image.session_id(), image.stream_id());
        let previous = self.sessions.insert(key, SessionState::Connected(image));

        match previous {
            Some(SessionState::Connected(_)) => {
                warn!(key = %key, "replacing an active image");
            }
            _ => {
                debug!(key = %key, "image added");
            }
        }
    }

    /// Deactivates an image and puts its key into cooldown.
    ///
    /// The directory entry is only replaced when it still holds this very
    /// image; a stale handle for a key that has moved on leaves it alone.
    pub fn remove_publication_image(&mut self, image: &Arc<I>) {
        let key = SessionStreamKey::new(image.session_id(), image.stream_id());

        if let Some(state) = self.sessions.get_mut(&key)
            && let SessionState::Connected(current) = &*state
            && Arc::ptr_eq(current, image)
        {
            *state = SessionState::CoolDown;
            debug!(key = %key, "image removed, cooling down");
        }

        image.if_active_go_inactive();
    }

    /// Forgets a handshake so the next DATA elicits SETUP again.
    ///
    /// No-op unless the key is pending.
    pub fn remove_pending_setup(&mut self, session_id: SessionId, stream_id: StreamId) {
        let key = SessionStreamKey::new(session_id, stream_id);
        if let Entry::Occupied(entry) = self.sessions.entry(key)
            && matches!(entry.get(), SessionState::Pending(_))
        {
            entry.remove();
            trace!(key = %key, "pending setup removed");
        }
    }

    /// Ends a cooldown; the key returns to unknown.
    ///
    /// No-op unless the key is cooling down.
    pub fn remove_cool_down(&mut self, session_id: SessionId, stream_id: StreamId) {
        let key = SessionStreamKey::new(session_id, stream_id);
        if let Entry::Occupied(entry) = self.sessions.entry(key)
            && matches!(entry.get(), SessionState::CoolDown)
        {
            entry.remove();
            debug!(key = %key, "cool down removed");
        }
    }

    /// Handles a DATA frame. Returns the bytes the image accepted.
    ///
    /// With an image the frame is forwarded as is; the image decides whether
    /// it still wants it. Without one, the first frame elicits SETUP from the
    /// sender and registers the handshake, later frames do nothing until the
    /// handshake is cleared.
    pub fn on_data_packet<E>(
        &mut self,
        endpoint: &Arc<E>,
        header: &DataHeader,
        buffer: &[u8],
        source: Endpoint,
    ) -> usize
    where
        E: ChannelEndpoint,
        R: PendingSetupRegistry<E>,
    {
        let key = SessionStreamKey::new(header.session_id, header.stream_id);
        if !self.subscriptions.contains(&key.stream_id) {
            return 0;
        }

        match self.sessions.entry(key).or_insert_with(SessionState::pending) {
            SessionState::CoolDown => {
                trace!(key = %key, "DATA during cool down, ignoring");
                0
            }
            SessionState::Connected(image) => {
                let _status = image.status();
                trace!(
                    key = %key,
                    status = ?_status,
                    term_id = header.term_id,
                    term_offset = header.term_offset,
                    length = buffer.len(),
                    "DATA forwarded"
                );
                image.insert_packet(header.term_id, header.term_offset, buffer)
            }
            SessionState::Pending(pending) => {
                if !pending.setup_elicited {
                    debug!(key = %key, source = %source, "eliciting SETUP");
                    endpoint.send_setup_eliciting_status_message(
                        source,
                        key.session_id,
                        key.stream_id,
                    );
                    self.pending_setups.add_pending_setup_message(
                        key.session_id,
                        key.stream_id,
                        Arc::clone(endpoint),
                    );
                    pending.setup_elicited = true;
                }
                0
            }
        }
    }

    /// Handles a SETUP frame.
    ///
    /// The first SETUP for a key without an image asks the conductor for one.
    /// Repeats, and SETUPs for keys that already have an image, are ignored.
    pub fn on_setup_message<E>(&mut self, endpoint: &Arc<E>, header: &SetupHeader, source: Endpoint)
    where
        E: ChannelEndpoint,
        C: ImageCreator<E>,
    {
        let key = SessionStreamKey::new(header.session_id, header.stream_id);
        if !self.subscriptions.contains(&key.stream_id) {
            return;
        }

        match self.sessions.entry(key).or_insert_with(SessionState::pending) {
            SessionState::CoolDown | SessionState::Connected(_) => {
                trace!(key = %key, "SETUP ignored");
            }
            SessionState::Pending(pending) => {
                if pending.image_requested {
                    return;
                }

                let control_address = match endpoint.multicast_control_address() {
                    Some(control) if endpoint.is_multicast() => control,
                    _ => source,
                };
                debug!(
                    key = %key,
                    source = %source,
                    control = %control_address,
                    term_length = header.term_length,
                    mtu = header.mtu,
                    "requesting image"
                );
                self.image_creator
                    .create_publication_image(CreateImageRequest {
                        session_id: key.session_id,
                        stream_id: key.stream_id,
                        initial_term_id: header.initial_term_id,
                        active_term_id: header.active_term_id,
                        term_offset: header.term_offset,
                        term_length: header.term_length,
                        mtu: header.mtu,
                        control_address,
                        source_address: source,
                        endpoint: Arc::clone(endpoint),
                    });
                pending.image_requested = true;
            }
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, stream_id: StreamId) -> bool {
        self.subscriptions.contains(&stream_id)
    }

    #[must_use]
    pub fn state(&self, session_id: SessionId, stream_id: StreamId) -> ConnectionState {
        self.sessions
            .get(&SessionStreamKey::new(session_id, stream_id))
            .map_or(ConnectionState::Unknown, SessionState::connection_state)
    }

    /// Whether the key is pending and has already asked for an image.
    #[must_use]
    pub fn is_image_requested(&self, session_id: SessionId, stream_id: StreamId) -> bool {
        matches!(
            self.sessions.get(&SessionStreamKey::new(session_id, stream_id)),
            Some(SessionState::Pending(PendingConnection {
                image_requested: true,
                ..
            }))
        )
    }

    /// The active image for a key, if connected.
    #[must_use]
    pub fn image(&self, session_id: SessionId, stream_id: StreamId) -> Option<&Arc<I>> {
        match self.sessions.get(&SessionStreamKey::new(session_id, stream_id)) {
            Some(SessionState::Connected(image)) => Some(image),
            _ => None,
        }
    }

    pub fn image_creator(&self) -> &C {
        &self.image_creator
    }

    pub fn image_creator_mut(&mut self) -> &mut C {
        &mut self.image_creator
    }

    pub fn pending_setups(&self) -> &R {
        &self.pending_setups
    }

    pub fn pending_setups_mut(&mut self) -> &mut R {
        &mut self.pending_setups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::ImageStatus;
    use crate::protocol::TERM_MIN_LENGTH;
    use std::cell::{Cell, RefCell};

    const SESSION_ID: SessionId = SessionId::new(1);
    const STREAM_ID: StreamId = StreamId::new(10);
    const ACTIVE_TERM_ID: i32 = 3;
    const INITIAL_TERM_ID: i32 = 3;
    const TERM_OFFSET: i32 = 0;
    const MTU_LENGTH: u32 = 1024;
    const CAPACITY: usize = 100;

    #[derive(Debug, Default)]
    struct RecordingEndpoint {
        multicast_control: Option<Endpoint>,
        elicited: RefCell<Vec<(Endpoint, SessionId, StreamId)>>,
    }

    impl ChannelEndpoint for RecordingEndpoint {
        fn send_setup_eliciting_status_message(
            &self,
            destination: Endpoint,
            session_id: SessionId,
            stream_id: StreamId,
        ) {
            self.elicited
                .borrow_mut()
                .push((destination, session_id, stream_id));
        }

        fn is_multicast(&self) -> bool {
            self.multicast_control.is_some()
        }

        fn multicast_control_address(&self) -> Option<Endpoint> {
            self.multicast_control
        }
    }

    #[derive(Default)]
    struct RecordingConductor {
        requests: Vec<CreateImageRequest<RecordingEndpoint>>,
    }

    impl ImageCreator<RecordingEndpoint> for RecordingConductor {
        fn create_publication_image(&mut self, request: CreateImageRequest<RecordingEndpoint>) {
            self.requests.push(request);
        }
    }

    #[derive(Default)]
    struct RecordingRegistry {
        registered: Vec<(SessionId, StreamId)>,
    }

    impl PendingSetupRegistry<RecordingEndpoint> for RecordingRegistry {
        fn add_pending_setup_message(
            &mut self,
            session_id: SessionId,
            stream_id: StreamId,
            _endpoint: Arc<RecordingEndpoint>,
        ) {
            self.registered.push((session_id, stream_id));
        }
    }

    struct FakeImage {
        session_id: SessionId,
        stream_id: StreamId,
        status: Cell<ImageStatus>,
        status_reads: Cell<usize>,
        go_inactive_calls: Cell<usize>,
        inserted: RefCell<Vec<(i32, i32, usize)>>,
    }

    impl FakeImage {
        fn new(session_id: SessionId, stream_id: StreamId) -> Arc<Self> {
            Arc::new(Self {
                session_id,
                stream_id,
                status: Cell::new(ImageStatus::Active),
                status_reads: Cell::new(0),
                go_inactive_calls: Cell::new(0),
                inserted: RefCell::new(Vec::new()),
            })
        }
    }

    impl PublicationImage for FakeImage {
        fn session_id(&self) -> SessionId {
            self.session_id
        }

        fn stream_id(&self) -> StreamId {
            self.stream_id
        }

        fn status(&self) -> ImageStatus {
            self.status_reads.set(self.status_reads.get() + 1);
            self.status.get()
        }

        fn insert_packet(&self, term_id: i32, term_offset: i32, buffer: &[u8]) -> usize {
            self.inserted
                .borrow_mut()
                .push((term_id, term_offset, buffer.len()));
            buffer.len()
        }

        fn if_active_go_inactive(&self) {
            self.go_inactive_calls.set(self.go_inactive_calls.get() + 1);
            self.status.set(ImageStatus::Inactive);
        }
    }

    type Dispatcher = DataPacketDispatcher<FakeImage, RecordingConductor, RecordingRegistry>;

    struct Fixture {
        dispatcher: Dispatcher,
        endpoint: Arc<RecordingEndpoint>,
        image: Arc<FakeImage>,
        data: DataHeader,
        setup: SetupHeader,
        payload: [u8; CAPACITY],
        source: Endpoint,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dispatcher: Dispatcher::new(
                    RecordingConductor::default(),
                    RecordingRegistry::default(),
                ),
                endpoint: Arc::new(RecordingEndpoint::default()),
                image: FakeImage::new(SESSION_ID, STREAM_ID),
                data: DataHeader {
                    flags: 0,
                    term_offset: TERM_OFFSET,
                    session_id: SESSION_ID,
                    stream_id: STREAM_ID,
                    term_id: ACTIVE_TERM_ID,
                    reserved_value: 0,
                },
                setup: SetupHeader {
                    term_offset: TERM_OFFSET,
                    session_id: SESSION_ID,
                    stream_id: STREAM_ID,
                    initial_term_id: INITIAL_TERM_ID,
                    active_term_id: ACTIVE_TERM_ID,
                    term_length: TERM_MIN_LENGTH,
                    mtu: MTU_LENGTH,
                    ttl: 0,
                },
                payload: [0u8; CAPACITY],
                source: Endpoint::localhost(40123),
            }
        }

        fn on_data(&mut self) -> usize {
            self.dispatcher
                .on_data_packet(&self.endpoint, &self.data, &self.payload, self.source)
        }

        fn on_setup(&mut self) {
            self.dispatcher
                .on_setup_message(&self.endpoint, &self.setup, self.source);
        }

        fn elicited(&self) -> Vec<(Endpoint, SessionId, StreamId)> {
            self.endpoint.elicited.borrow().clone()
        }

        fn registered(&self) -> &[(SessionId, StreamId)] {
            &self.dispatcher.pending_setups().registered
        }

        fn requests(&self) -> &[CreateImageRequest<RecordingEndpoint>] {
            &self.dispatcher.image_creator().requests
        }
    }

    #[test]
    fn data_without_image_elicits_setup() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        assert_eq!(f.on_data(), 0);

        assert!(f.image.inserted.borrow().is_empty());
        assert_eq!(f.elicited(), vec![(f.source, SESSION_ID, STREAM_ID)]);
        assert_eq!(f.registered(), &[(SESSION_ID, STREAM_ID)]);
        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::PendingSetup
        );
    }

    #[test]
    fn repeated_data_elicits_setup_once() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        for _ in 0..3 {
            f.on_data();
        }

        assert_eq!(f.elicited().len(), 1);
        assert_eq!(f.registered().len(), 1);
    }

    #[test]
    fn removing_pending_setup_allows_another_elicitation() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        f.on_data();
        f.on_data();
        f.dispatcher.remove_pending_setup(SESSION_ID, STREAM_ID);
        f.on_data();
        f.on_data();

        assert!(f.image.inserted.borrow().is_empty());
        assert_eq!(f.elicited().len(), 2);
        assert_eq!(f.registered(), &[(SESSION_ID, STREAM_ID); 2]);
    }

    #[test]
    fn unsubscribed_stream_is_ignored() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(StreamId::new(11));

        f.on_data();
        f.on_setup();

        assert!(f.elicited().is_empty());
        assert!(f.registered().is_empty());
        assert!(f.requests().is_empty());
        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::Unknown
        );
    }

    #[test]
    fn add_subscription_is_idempotent() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.remove_subscription(STREAM_ID);

        assert!(!f.dispatcher.is_subscribed(STREAM_ID));
        f.on_data();
        assert!(f.elicited().is_empty());
    }

    #[test]
    fn setup_requests_image() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        f.on_setup();

        let requests = f.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.session_id, SESSION_ID);
        assert_eq!(request.stream_id, STREAM_ID);
        assert_eq!(request.initial_term_id, INITIAL_TERM_ID);
        assert_eq!(request.active_term_id, ACTIVE_TERM_ID);
        assert_eq!(request.term_offset, TERM_OFFSET);
        assert_eq!(request.term_length, TERM_MIN_LENGTH);
        assert_eq!(request.mtu, MTU_LENGTH);
        assert_eq!(request.source_address, f.source);
        assert_eq!(request.control_address, f.source);
        assert!(Arc::ptr_eq(&request.endpoint, &f.endpoint));
    }

    #[test]
    fn repeated_setup_requests_image_once() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        for _ in 0..3 {
            f.on_setup();
        }

        assert_eq!(f.requests().len(), 1);
    }

    #[test]
    fn multicast_setup_uses_control_address() {
        let mut f = Fixture::new();
        let control = Endpoint::new_v4(224, 10, 9, 8, 40456);
        f.endpoint = Arc::new(RecordingEndpoint {
            multicast_control: Some(control),
            ..RecordingEndpoint::default()
        });
        f.dispatcher.add_subscription(STREAM_ID);

        f.on_setup();

        assert_eq!(f.requests()[0].control_address, control);
        assert_eq!(f.requests()[0].source_address, f.source);
    }

    #[test]
    fn setup_after_image_added_is_ignored() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.on_setup();
        f.on_setup();

        assert!(f.requests().is_empty());
    }

    #[test]
    fn image_added_after_handshake_stops_setup_requests() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        f.on_data();
        f.on_setup();
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.dispatcher.remove_pending_setup(SESSION_ID, STREAM_ID);
        f.on_setup();
        f.on_setup();

        assert_eq!(f.requests().len(), 1);
        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::Connected,
            "a late pending-setup timeout must not drop the image"
        );
    }

    #[test]
    fn remove_subscription_deactivates_image_once() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.dispatcher.remove_subscription(STREAM_ID);
        f.dispatcher.remove_subscription(STREAM_ID);

        assert_eq!(f.image.go_inactive_calls.get(), 1);
        assert!(
            f.dispatcher.image(SESSION_ID, STREAM_ID).is_some(),
            "image stays until explicitly removed"
        );
    }

    #[test]
    fn remove_subscription_deactivates_every_session_of_the_stream() {
        let mut f = Fixture::new();
        let second = FakeImage::new(SessionId::new(2), STREAM_ID);
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.dispatcher.add_publication_image(Arc::clone(&second));

        f.dispatcher.remove_subscription(STREAM_ID);
        f.dispatcher.remove_subscription(STREAM_ID);

        assert_eq!(f.image.go_inactive_calls.get(), 1);
        assert_eq!(second.go_inactive_calls.get(), 1);
        assert_eq!(f.image.status.get(), ImageStatus::Inactive);
        assert_eq!(second.status.get(), ImageStatus::Inactive);
    }

    #[test]
    fn image_requested_tracks_the_setup_latch() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        f.on_data();
        assert!(!f.dispatcher.is_image_requested(SESSION_ID, STREAM_ID));

        f.on_setup();
        assert!(f.dispatcher.is_image_requested(SESSION_ID, STREAM_ID));

        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        assert!(!f.dispatcher.is_image_requested(SESSION_ID, STREAM_ID));
    }

    #[test]
    fn remove_subscription_leaves_other_streams_alone() {
        let mut f = Fixture::new();
        let other = FakeImage::new(SESSION_ID, StreamId::new(11));
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_subscription(StreamId::new(11));
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.dispatcher.add_publication_image(Arc::clone(&other));

        f.dispatcher.remove_subscription(STREAM_ID);

        assert_eq!(f.image.go_inactive_calls.get(), 1);
        assert_eq!(other.go_inactive_calls.get(), 0);
    }

    #[test]
    fn resubscribe_starts_a_fresh_handshake() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.on_data();

        f.dispatcher.remove_subscription(STREAM_ID);
        f.dispatcher.add_subscription(STREAM_ID);
        f.on_data();

        assert_eq!(f.elicited().len(), 2);
    }

    #[test]
    fn remove_image_deactivates_it() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.dispatcher.remove_publication_image(&f.image);

        assert_eq!(f.image.go_inactive_calls.get(), 1);
        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::CoolDown
        );
    }

    #[test]
    fn data_and_setup_ignored_after_image_removed() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.dispatcher.remove_publication_image(&f.image);

        f.on_data();
        f.on_setup();
        f.dispatcher.remove_pending_setup(SESSION_ID, STREAM_ID);
        f.on_data();

        assert!(f.image.inserted.borrow().is_empty());
        assert!(f.elicited().is_empty());
        assert!(f.registered().is_empty());
        assert!(f.requests().is_empty());
        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::CoolDown
        );
    }

    #[test]
    fn cool_down_removal_restores_handshake() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.dispatcher.remove_publication_image(&f.image);
        f.dispatcher.remove_cool_down(SESSION_ID, STREAM_ID);

        f.on_data();
        f.on_setup();

        assert!(f.image.inserted.borrow().is_empty());
        assert_eq!(f.elicited(), vec![(f.source, SESSION_ID, STREAM_ID)]);
        assert_eq!(f.registered(), &[(SESSION_ID, STREAM_ID)]);
        assert_eq!(f.requests().len(), 1);
        assert_eq!(f.requests()[0].term_length, TERM_MIN_LENGTH);
    }

    #[test]
    fn clearing_unknown_keys_is_a_no_op() {
        let mut f = Fixture::new();
        f.dispatcher.remove_pending_setup(SESSION_ID, STREAM_ID);
        f.dispatcher.remove_cool_down(SESSION_ID, STREAM_ID);
        f.dispatcher.remove_subscription(STREAM_ID);

        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::Unknown
        );
    }

    #[test]
    fn remove_cool_down_does_not_touch_an_active_image() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.dispatcher.remove_cool_down(SESSION_ID, STREAM_ID);

        assert_eq!(
            f.dispatcher.state(SESSION_ID, STREAM_ID),
            ConnectionState::Connected
        );
    }

    #[test]
    fn stale_image_handle_does_not_evict_current_image() {
        let mut f = Fixture::new();
        let stale = FakeImage::new(SESSION_ID, STREAM_ID);
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.dispatcher.remove_publication_image(&stale);

        assert_eq!(stale.go_inactive_calls.get(), 1);
        assert_eq!(f.image.go_inactive_calls.get(), 0);
        let current = f.dispatcher.image(SESSION_ID, STREAM_ID).unwrap();
        assert!(Arc::ptr_eq(current, &f.image));
    }

    #[test]
    fn data_is_dispatched_to_image() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        assert_eq!(f.on_data(), CAPACITY);

        assert_eq!(f.image.status_reads.get(), 1);
        assert_eq!(
            *f.image.inserted.borrow(),
            vec![(ACTIVE_TERM_ID, TERM_OFFSET, CAPACITY)]
        );
        assert!(f.elicited().is_empty());
        assert!(f.registered().is_empty());
    }

    #[test]
    fn each_data_frame_is_forwarded_once() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        for offset in [0, 128, 256] {
            f.data.term_offset = offset;
            f.on_data();
        }

        let offsets: Vec<_> = f.image.inserted.borrow().iter().map(|p| p.1).collect();
        assert_eq!(offsets, vec![0, 128, 256]);
    }

    #[test]
    fn inactive_image_still_receives_the_forward() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.image.status.set(ImageStatus::Inactive);

        f.on_data();

        assert_eq!(f.image.inserted.borrow().len(), 1);
    }

    #[test]
    fn sessions_on_the_same_stream_are_independent() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);
        f.dispatcher.add_publication_image(Arc::clone(&f.image));

        f.data.session_id = SessionId::new(2);
        f.on_data();

        assert!(f.image.inserted.borrow().is_empty());
        assert_eq!(f.elicited(), vec![(f.source, SessionId::new(2), STREAM_ID)]);
    }

    #[test]
    fn full_handshake_scenario() {
        let mut f = Fixture::new();
        f.dispatcher.add_subscription(STREAM_ID);

        for _ in 0..3 {
            f.on_data();
        }
        assert_eq!(f.elicited().len(), 1);

        f.on_setup();
        assert_eq!(f.requests().len(), 1);

        f.dispatcher.add_publication_image(Arc::clone(&f.image));
        f.on_setup();
        f.on_setup();
        assert_eq!(f.requests().len(), 1);

        f.on_data();
        assert_eq!(f.image.inserted.borrow().len(), 1);
        assert_eq!(f.elicited().len(), 1);
    }
}
