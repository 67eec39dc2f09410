//! Receive channel endpoints: the UDP sockets DATA and SETUP arrive on.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

use crate::net::{Endpoint, UdpSocket};
use crate::protocol::{self, STATUS_MESSAGE_LENGTH, SessionId, StatusMessage, StreamId};
use crate::trace::{debug, error, trace, warn};

/// What the dispatcher needs from the endpoint a frame arrived on.
pub trait ChannelEndpoint {
    /// Asks the sender at `destination` to (re)send SETUP for the stream.
    ///
    /// Fire-and-forget: failures are handled by the endpoint.
    fn send_setup_eliciting_status_message(
        &self,
        destination: Endpoint,
        session_id: SessionId,
        stream_id: StreamId,
    );

    fn is_multicast(&self) -> bool;

    /// Where control traffic goes for a multicast channel.
    fn multicast_control_address(&self) -> Option<Endpoint> {
        None
    }
}

/// Errors opening a receive channel endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("socket option failed: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to join multicast group {group}: {source}")]
    Multicast {
        group: IpAddr,
        #[source]
        source: io::Error,
    },
}

/// Configuration for a [`ReceiveChannelEndpoint`].
#[derive(Debug, Clone)]
pub struct ChannelEndpointConfig {
    /// Unicast address to bind, or the multicast group to join.
    pub bind: Endpoint,
    /// Local interface used for multicast membership.
    pub interface: Ipv4Addr,
    /// Control address for a multicast channel.
    pub multicast_control: Option<Endpoint>,
    /// Identifies this receiver in status messages.
    pub receiver_id: i64,
    /// `SO_RCVBUF` to request, kernel default if `None`.
    pub socket_rcvbuf: Option<usize>,
}

impl Default for ChannelEndpointConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::any(0),
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_control: None,
            receiver_id: i64::from(std::process::id()),
            socket_rcvbuf: None,
        }
    }
}

/// A UDP socket DATA and SETUP frames are received on.
///
/// Shared with the conductor through image requests, but only the receiver
/// thread reads from it. Status messages go out of the same socket.
#[derive(Debug)]
pub struct ReceiveChannelEndpoint {
    socket: UdpSocket,
    channel: Endpoint,
    multicast_control: Option<Endpoint>,
    receiver_id: i64,
}

impl ReceiveChannelEndpoint {
    /// Opens the socket described by `config`.
    ///
    /// For an IPv4 multicast `bind` the wildcard address on the group port is
    /// bound and the group joined on `interface`.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointError`] if the socket cannot be bound, configured
    /// or joined to its group.
    pub fn open(config: &ChannelEndpointConfig) -> Result<Self, EndpointError> {
        let channel = config.bind;
        let bind_to = if channel.is_multicast() {
            Endpoint::any(channel.port())
        } else {
            channel
        };

        let socket = UdpSocket::bind(bind_to).map_err(|source| {
            error!(endpoint = %bind_to, error = %source, "failed to bind receive channel endpoint");
            EndpointError::Bind {
                endpoint: bind_to,
                source,
            }
        })?;

        if let Some(size) = config.socket_rcvbuf {
            socket.set_recv_buffer_size(size).map_err(EndpointError::Socket)?;
        }

        if channel.is_multicast() {
            let group = channel.ip();
            let IpAddr::V4(v4) = group else {
                return Err(EndpointError::Multicast {
                    group,
                    source: io::Error::new(io::ErrorKind::Unsupported, "IPv6 multicast"),
                });
            };
            socket
                .join_multicast_v4(v4, config.interface)
                .map_err(|source| EndpointError::Multicast { group, source })?;
        }

        debug!(channel = %channel, local = ?socket.local_addr().ok(), "receive channel endpoint open");

        Ok(Self {
            socket,
            channel,
            multicast_control: config.multicast_control,
            receiver_id: config.receiver_id,
        })
    }

    /// The address the endpoint was configured with.
    #[must_use]
    pub const fn channel(&self) -> Endpoint {
        self.channel
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }

    #[must_use]
    pub const fn receiver_id(&self) -> i64 {
        self.receiver_id
    }

    /// Receives one datagram if one is ready.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `WouldBlock`.
    pub fn poll(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        self.socket.try_recv_from(buf)
    }
}

impl ChannelEndpoint for ReceiveChannelEndpoint {
    fn send_setup_eliciting_status_message(
        &self,
        destination: Endpoint,
        session_id: SessionId,
        stream_id: StreamId,
    ) {
        let sm = StatusMessage::setup_eliciting(session_id, stream_id, self.receiver_id);
        let mut buf = Vec::with_capacity(STATUS_MESSAGE_LENGTH);
        protocol::encode_status_message(&sm, &mut buf);

        match self.socket.try_send_to(&buf, destination) {
            Ok(Some(_)) => {
                trace!(dest = %destination, session_id = %session_id, stream_id = %stream_id, "setup-eliciting SM sent");
            }
            Ok(None) => {
                warn!(dest = %destination, "send buffer full, setup-eliciting SM dropped");
            }
            Err(_e) => {
                warn!(dest = %destination, error = %_e, "failed to send setup-eliciting SM");
            }
        }
    }

    fn is_multicast(&self) -> bool {
        self.channel.is_multicast()
    }

    fn multicast_control_address(&self) -> Option<Endpoint> {
        self.multicast_control
    }
}
