//! Publication images: the receiver's copy of one sender's stream.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::net::Endpoint;
use crate::protocol::{self, ProtocolError, SessionId, StreamId};
use crate::trace::{debug, trace};

use super::dispatcher::CreateImageRequest;
use super::types::{AtomicImageStatus, ImageStatus};

/// Number of term buffers an image keeps.
pub const PARTITION_COUNT: usize = 3;

/// What the dispatcher needs from an image.
///
/// Every method takes `&self`: images are shared with the conductor, which
/// may read their status concurrently.
pub trait PublicationImage {
    fn session_id(&self) -> SessionId;

    fn stream_id(&self) -> StreamId;

    fn status(&self) -> ImageStatus;

    /// Stores a DATA frame. Returns the number of bytes accepted, 0 if the
    /// frame was dropped.
    fn insert_packet(&self, term_id: i32, term_offset: i32, buffer: &[u8]) -> usize;

    /// Moves the image to inactive. Idempotent.
    fn if_active_go_inactive(&self);
}

/// Term-buffered image of a publication.
///
/// Frames are copied into one of [`PARTITION_COUNT`] rotating term buffers
/// selected by term id. The high-water mark is the furthest stream position
/// seen so far; frames older than the retained partitions are dropped.
pub struct Image {
    correlation_id: i64,
    session_id: SessionId,
    stream_id: StreamId,
    initial_term_id: i32,
    term_length: u32,
    position_bits_to_shift: u32,
    mtu: u32,
    source_address: Endpoint,
    control_address: Endpoint,
    status: AtomicImageStatus,
    hwm_position: AtomicI64,
    terms: Mutex<[Box<[u8]>; PARTITION_COUNT]>,
}

impl Image {
    /// Builds an image for a request coming out of the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidTermLength`] or
    /// [`ProtocolError::InvalidMtu`] if the announced geometry is unusable.
    pub fn new<E>(correlation_id: i64, request: &CreateImageRequest<E>) -> Result<Self, ProtocolError> {
        Self::with_term_limit(correlation_id, request, protocol::TERM_MAX_LENGTH)
    }

    /// Like [`Image::new`], but refuses terms longer than `max_term_length`.
    ///
    /// An image holds three terms, so this caps its memory at three times
    /// the limit.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidTermLength`] if the term length is
    /// invalid or above the limit, [`ProtocolError::InvalidMtu`] if the MTU
    /// is unusable.
    pub fn with_term_limit<E>(
        correlation_id: i64,
        request: &CreateImageRequest<E>,
        max_term_length: u32,
    ) -> Result<Self, ProtocolError> {
        protocol::validate_term_length(request.term_length)?;
        if request.term_length > max_term_length {
            return Err(ProtocolError::InvalidTermLength(request.term_length));
        }
        protocol::validate_mtu(request.mtu)?;

        let term_length = request.term_length;
        let position_bits_to_shift = term_length.trailing_zeros();
        let terms = std::array::from_fn(|_| vec![0u8; term_length as usize].into_boxed_slice());

        let term_count = request.active_term_id.wrapping_sub(request.initial_term_id);
        let initial_position =
            compute_position(term_count, request.term_offset, position_bits_to_shift);

        debug!(
            correlation_id,
            session_id = %request.session_id,
            stream_id = %request.stream_id,
            term_length,
            initial_position,
            "image created"
        );

        Ok(Self {
            correlation_id,
            session_id: request.session_id,
            stream_id: request.stream_id,
            initial_term_id: request.initial_term_id,
            term_length,
            position_bits_to_shift,
            mtu: request.mtu,
            source_address: request.source_address,
            control_address: request.control_address,
            status: AtomicImageStatus::new_active(),
            hwm_position: AtomicI64::new(initial_position),
            terms: Mutex::new(terms),
        })
    }

    #[must_use]
    pub const fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[must_use]
    pub const fn term_length(&self) -> u32 {
        self.term_length
    }

    #[must_use]
    pub const fn mtu(&self) -> u32 {
        self.mtu
    }

    #[must_use]
    pub const fn source_address(&self) -> Endpoint {
        self.source_address
    }

    #[must_use]
    pub const fn control_address(&self) -> Endpoint {
        self.control_address
    }

    /// Highest stream position covered by a stored frame.
    #[must_use]
    pub fn hwm_position(&self) -> i64 {
        self.hwm_position.load(Ordering::Acquire)
    }

    /// Copies `length` stored bytes starting at `term_offset` of `term_id`.
    ///
    /// Returns `None` if the range falls outside the term or the term precedes
    /// the initial term. Partitions are reused, so bytes of an old term may
    /// have been overwritten by a newer one.
    #[must_use]
    pub fn read_term(&self, term_id: i32, term_offset: i32, length: usize) -> Option<Vec<u8>> {
        let term_count = term_id.wrapping_sub(self.initial_term_id);
        let start = usize::try_from(term_offset).ok()?;
        if term_count < 0 || start + length > self.term_length as usize {
            return None;
        }

        let terms = self.terms.lock().unwrap_or_else(PoisonError::into_inner);
        let partition = &terms[partition_index(term_count)];
        Some(partition[start..start + length].to_vec())
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("correlation_id", &self.correlation_id)
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("term_length", &self.term_length)
            .field("status", &self.status.load())
            .field("hwm_position", &self.hwm_position())
            .finish_non_exhaustive()
    }
}

impl PublicationImage for Image {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn status(&self) -> ImageStatus {
        self.status.load()
    }

    fn insert_packet(&self, term_id: i32, term_offset: i32, buffer: &[u8]) -> usize {
        if self.status.load() != ImageStatus::Active {
            return 0;
        }

        let term_count = term_id.wrapping_sub(self.initial_term_id);
        let Ok(start) = usize::try_from(term_offset) else {
            return 0;
        };
        let length = buffer.len();
        if term_count < 0 || start + length > self.term_length as usize {
            trace!(term_id, term_offset, length, "frame outside term, dropping");
            return 0;
        }

        let position = compute_position(term_count, term_offset, self.position_bits_to_shift);
        let end_position = position + length as i64;
        let window = i64::from(self.term_length) * (PARTITION_COUNT as i64 - 1);
        if end_position <= self.hwm_position() - window {
            trace!(term_id, term_offset, position, "frame too old, dropping");
            return 0;
        }

        {
            let mut terms = self.terms.lock().unwrap_or_else(PoisonError::into_inner);
            terms[partition_index(term_count)][start..start + length].copy_from_slice(buffer);
        }
        self.hwm_position.fetch_max(end_position, Ordering::AcqRel);

        length
    }

    fn if_active_go_inactive(&self) {
        if self.status.go_inactive() {
            debug!(
                correlation_id = self.correlation_id,
                session_id = %self.session_id,
                stream_id = %self.stream_id,
                "image inactive"
            );
        }
    }
}

#[inline]
const fn compute_position(term_count: i32, term_offset: i32, position_bits_to_shift: u32) -> i64 {
    ((term_count as i64) << position_bits_to_shift) + term_offset as i64
}

#[inline]
const fn partition_index(term_count: i32) -> usize {
    term_count as usize % PARTITION_COUNT
}
