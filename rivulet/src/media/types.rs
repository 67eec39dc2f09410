//! Identity and status types shared by the dispatcher and images.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::{SessionId, StreamId};

/// One sender's stream instance as seen by this receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionStreamKey {
    pub session_id: SessionId,
    pub stream_id: StreamId,
}

impl SessionStreamKey {
    #[must_use]
    pub const fn new(session_id: SessionId, stream_id: StreamId) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }
}

impl fmt::Display for SessionStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.stream_id)
    }
}

/// Lifecycle status of a publication image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageStatus {
    Active = 0,
    Inactive = 1,
}

/// Image status readable from any thread without locking.
///
/// The only transition is Active -> Inactive, made at most once.
#[derive(Debug)]
pub struct AtomicImageStatus(AtomicU8);

impl AtomicImageStatus {
    #[must_use]
    pub const fn new_active() -> Self {
        Self(AtomicU8::new(ImageStatus::Active as u8))
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> ImageStatus {
        if self.0.load(Ordering::Acquire) == ImageStatus::Active as u8 {
            ImageStatus::Active
        } else {
            ImageStatus::Inactive
        }
    }

    /// Moves Active -> Inactive. Returns `true` only for the call that made
    /// the transition.
    pub fn go_inactive(&self) -> bool {
        self.0
            .compare_exchange(
                ImageStatus::Active as u8,
                ImageStatus::Inactive as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicImageStatus {
    fn default() -> Self {
        Self::new_active()
    }
}
