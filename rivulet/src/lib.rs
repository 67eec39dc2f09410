//! Receive side of a reliable UDP messaging driver.
//!
//! Inbound datagrams are classified per (session, stream): DATA for a stream
//! with an image is stored in that image, DATA for an unknown stream elicits
//! SETUP from its sender, and SETUP asks the conductor to build an image.
//! See [`media::DataPacketDispatcher`] for the state machine and
//! [`runtime::Receiver`] for the thread that drives it.

pub mod media;
pub mod net;
pub mod protocol;
pub mod runtime;
pub mod sync;

mod trace;

pub use trace::init_tracing;
