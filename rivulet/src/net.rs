//! UDP transport primitives used by receive channel endpoints.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
