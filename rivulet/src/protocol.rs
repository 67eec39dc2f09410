//! Wire format of the frames the receive path handles.
//!
//! Every frame starts with the same 8-byte header, little-endian:
//!
//! ```text
//! ┌───────────────────────────────────┬─────────┬─────────┬───────────────────┐
//! │ Frame Length (4)                  │ Ver(1)  │ Flags(1)│ Type (2)          │
//! └───────────────────────────────────┴─────────┴─────────┴───────────────────┘
//! ```
//!
//! The receiver sees DATA and SETUP from senders, and sends status messages
//! (SM) back. An SM carrying [`flags::SEND_SETUP`] asks the sender to (re)send
//! SETUP so that an image can be created.

use std::fmt;
use thiserror::Error;

/// Protocol version carried in every header.
pub const CURRENT_VERSION: u8 = 0;

/// Frames and MTUs are multiples of this.
pub const FRAME_ALIGNMENT: u32 = 32;

/// Common header length.
pub const HEADER_LENGTH: usize = 8;

/// DATA header length; payload follows.
pub const DATA_HEADER_LENGTH: usize = 32;

/// SETUP frame length.
pub const SETUP_LENGTH: usize = 40;

/// Status message frame length.
pub const STATUS_MESSAGE_LENGTH: usize = 36;

/// Smallest term a sender may announce in SETUP.
pub const TERM_MIN_LENGTH: u32 = 64 * 1024;

/// Largest term a sender may announce in SETUP.
pub const TERM_MAX_LENGTH: u32 = 1024 * 1024 * 1024;

/// Largest UDP payload that fits an IPv4 datagram, aligned down to 32.
pub const MAX_UDP_PAYLOAD_LENGTH: u32 = 65504;

/// Frame type discriminants.
pub mod frame_type {
    pub const PAD: u16 = 0x00;
    pub const DATA: u16 = 0x01;
    pub const STATUS_MESSAGE: u16 = 0x03;
    pub const SETUP: u16 = 0x05;
}

/// Header flag bits.
pub mod flags {
    /// DATA: first fragment of a message.
    pub const BEGIN_FRAGMENT: u8 = 0x80;
    /// DATA: last fragment of a message.
    pub const END_FRAGMENT: u8 = 0x40;
    /// DATA: message fits in one frame.
    pub const UNFRAGMENTED: u8 = BEGIN_FRAGMENT | END_FRAGMENT;
    /// SM: sender should respond with SETUP.
    pub const SEND_SETUP: u8 = 0x80;
}

/// Sender-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(i32);

impl SessionId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// Raw value for wire serialization.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<i32> for SessionId {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream identifier a subscription expresses interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(i32);

impl StreamId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<i32> for StreamId {
    fn from(v: i32) -> Self {
        Self(v)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DATA header fields (the 32 bytes before the payload).
///
/// ```text
/// ┌──────────────────────────────────────────────────────────────────┐
/// │ Common header (8): length, version, flags, type=0x01             │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Term Offset (4) │ Session ID (4) │ Stream ID (4) │ Term ID (4)   │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Reserved Value (8)                                               │
/// └──────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub flags: u8,
    pub term_offset: i32,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub term_id: i32,
    pub reserved_value: i64,
}

/// SETUP frame: a sender announces the geometry of its stream.
///
/// ```text
/// ┌──────────────────────────────────────────────────────────────────┐
/// │ Common header (8): length=40, version, flags, type=0x05          │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Term Offset (4) │ Session ID (4) │ Stream ID (4)                 │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Initial Term ID (4) │ Active Term ID (4) │ Term Length (4)       │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ MTU (4) │ TTL (4)                                                │
/// └──────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    pub term_offset: i32,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    /// Power of two in `[TERM_MIN_LENGTH, TERM_MAX_LENGTH]`.
    pub term_length: u32,
    /// Multiple of `FRAME_ALIGNMENT`, at most `MAX_UDP_PAYLOAD_LENGTH`.
    pub mtu: u32,
    pub ttl: i32,
}

/// Status message sent by a receiver to a sender.
///
/// ```text
/// ┌──────────────────────────────────────────────────────────────────┐
/// │ Common header (8): length=36, version, flags, type=0x03          │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Session ID (4) │ Stream ID (4) │ Consumption Term ID (4)         │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Consumption Term Offset (4) │ Receiver Window (4)                │
/// ├──────────────────────────────────────────────────────────────────┤
/// │ Receiver ID (8)                                                  │
/// └──────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    pub flags: u8,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
}

impl StatusMessage {
    /// A status message asking the sender for SETUP. Carries no position.
    #[must_use]
    pub const fn setup_eliciting(session_id: SessionId, stream_id: StreamId, receiver_id: i64) -> Self {
        Self {
            flags: flags::SEND_SETUP,
            session_id,
            stream_id,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window: 0,
            receiver_id,
        }
    }

    #[must_use]
    pub const fn is_setup_eliciting(&self) -> bool {
        self.flags & flags::SEND_SETUP != 0
    }
}

/// A decoded frame, borrowing the datagram it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Pad,
    Data {
        header: DataHeader,
        /// Whole frame, header included, `frame_length` bytes long.
        frame: &'a [u8],
    },
    Setup(SetupHeader),
    StatusMessage(StatusMessage),
}

impl Frame<'_> {
    /// DATA payload, or an empty slice for every other frame.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Data { frame, .. } => &frame[DATA_HEADER_LENGTH..],
            _ => &[],
        }
    }
}

/// Errors during frame encode/decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("unknown frame type: 0x{0:04x}")]
    UnknownFrameType(u16),
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i32),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid term length: {0}")]
    InvalidTermLength(u32),
    #[error("invalid mtu: {0}")]
    InvalidMtu(u32),
    #[error("payload of {0} bytes does not fit a datagram")]
    PayloadTooLarge(usize),
}

/// Checks a term length announced by a sender.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidTermLength`] unless the length is a power
/// of two within `[TERM_MIN_LENGTH, TERM_MAX_LENGTH]`.
pub const fn validate_term_length(term_length: u32) -> Result<(), ProtocolError> {
    if term_length < TERM_MIN_LENGTH || term_length > TERM_MAX_LENGTH || !term_length.is_power_of_two() {
        return Err(ProtocolError::InvalidTermLength(term_length));
    }
    Ok(())
}

/// Checks an MTU announced by a sender.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidMtu`] unless the MTU holds a DATA header,
/// fits a UDP payload and is frame aligned.
pub const fn validate_mtu(mtu: u32) -> Result<(), ProtocolError> {
    if mtu < DATA_HEADER_LENGTH as u32 || mtu > MAX_UDP_PAYLOAD_LENGTH || mtu % FRAME_ALIGNMENT != 0 {
        return Err(ProtocolError::InvalidMtu(mtu));
    }
    Ok(())
}

struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_header(&mut self, frame_length: i32, flags: u8, frame_type: u16) {
        self.put_i32(frame_length);
        self.put_u8(CURRENT_VERSION);
        self.put_u8(flags);
        self.put_u16(frame_type);
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take<const W: usize>(&mut self) -> Result<[u8; W], ProtocolError> {
        let have = self.buf.len() - self.cursor;
        if have < W {
            return Err(ProtocolError::BufferTooSmall { need: W, have });
        }
        let mut arr = [0u8; W];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + W]);
        self.cursor += W;
        Ok(arr)
    }

    fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        self.take::<1>().map(|[b]| b)
    }

    fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        self.take().map(u16::from_le_bytes)
    }

    fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        self.take().map(i32::from_le_bytes)
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        self.take().map(u32::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, ProtocolError> {
        self.take().map(i64::from_le_bytes)
    }
}

/// Encodes a DATA frame into `buf` (cleared first, capacity kept).
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the frame would exceed
/// `MAX_UDP_PAYLOAD_LENGTH`.
pub fn encode_data(header: &DataHeader, payload: &[u8], buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let frame_length = DATA_HEADER_LENGTH + payload.len();
    if frame_length > MAX_UDP_PAYLOAD_LENGTH as usize {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut w = FrameWriter::new(buf);
    w.write_header(frame_length as i32, header.flags, frame_type::DATA);
    w.put_i32(header.term_offset);
    w.put_i32(header.session_id.as_i32());
    w.put_i32(header.stream_id.as_i32());
    w.put_i32(header.term_id);
    w.put_i64(header.reserved_value);
    w.buf.extend_from_slice(payload);
    Ok(())
}

/// Encodes a SETUP frame into `buf`.
pub fn encode_setup(setup: &SetupHeader, buf: &mut Vec<u8>) {
    let mut w = FrameWriter::new(buf);
    w.write_header(SETUP_LENGTH as i32, 0, frame_type::SETUP);
    w.put_i32(setup.term_offset);
    w.put_i32(setup.session_id.as_i32());
    w.put_i32(setup.stream_id.as_i32());
    w.put_i32(setup.initial_term_id);
    w.put_i32(setup.active_term_id);
    w.put_u32(setup.term_length);
    w.put_u32(setup.mtu);
    w.put_i32(setup.ttl);
}

/// Encodes a status message into `buf`.
pub fn encode_status_message(sm: &StatusMessage, buf: &mut Vec<u8>) {
    let mut w = FrameWriter::new(buf);
    w.write_header(STATUS_MESSAGE_LENGTH as i32, sm.flags, frame_type::STATUS_MESSAGE);
    w.put_i32(sm.session_id.as_i32());
    w.put_i32(sm.stream_id.as_i32());
    w.put_i32(sm.consumption_term_id);
    w.put_i32(sm.consumption_term_offset);
    w.put_i32(sm.receiver_window);
    w.put_i64(sm.receiver_id);
}

/// Decodes and validates the frame at the start of a datagram.
///
/// # Errors
///
/// Fails on truncated input, an unknown type or version, a frame length that
/// disagrees with the datagram, or SETUP geometry a receiver cannot host.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, ProtocolError> {
    let mut r = FrameReader::new(bytes);

    let frame_length = r.take_i32()?;
    let version = r.take_u8()?;
    let flags = r.take_u8()?;
    let frame_type = r.take_u16()?;

    if version != CURRENT_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let min_length = match frame_type {
        frame_type::PAD => HEADER_LENGTH,
        frame_type::DATA => DATA_HEADER_LENGTH,
        frame_type::SETUP => SETUP_LENGTH,
        frame_type::STATUS_MESSAGE => STATUS_MESSAGE_LENGTH,
        other => return Err(ProtocolError::UnknownFrameType(other)),
    };
    if bytes.len() < min_length {
        return Err(ProtocolError::BufferTooSmall {
            need: min_length,
            have: bytes.len(),
        });
    }
    let length = match usize::try_from(frame_length) {
        Ok(len) if len >= min_length && len <= bytes.len() => len,
        _ => return Err(ProtocolError::InvalidFrameLength(frame_length)),
    };

    match frame_type {
        frame_type::DATA => {
            let header = DataHeader {
                flags,
                term_offset: r.take_i32()?,
                session_id: SessionId::from(r.take_i32()?),
                stream_id: StreamId::from(r.take_i32()?),
                term_id: r.take_i32()?,
                reserved_value: r.take_i64()?,
            };
            Ok(Frame::Data {
                header,
                frame: &bytes[..length],
            })
        }
        frame_type::SETUP => {
            let setup = SetupHeader {
                term_offset: r.take_i32()?,
                session_id: SessionId::from(r.take_i32()?),
                stream_id: StreamId::from(r.take_i32()?),
                initial_term_id: r.take_i32()?,
                active_term_id: r.take_i32()?,
                term_length: r.take_u32()?,
                mtu: r.take_u32()?,
                ttl: r.take_i32()?,
            };
            validate_term_length(setup.term_length)?;
            validate_mtu(setup.mtu)?;
            Ok(Frame::Setup(setup))
        }
        frame_type::STATUS_MESSAGE => Ok(Frame::StatusMessage(StatusMessage {
            flags,
            session_id: SessionId::from(r.take_i32()?),
            stream_id: StreamId::from(r.take_i32()?),
            consumption_term_id: r.take_i32()?,
            consumption_term_offset: r.take_i32()?,
            receiver_window: r.take_i32()?,
            receiver_id: r.take_i64()?,
        })),
        _ => Ok(Frame::Pad),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SetupHeader {
        SetupHeader {
            term_offset: 0,
            session_id: SessionId::new(1),
            stream_id: StreamId::new(10),
            initial_term_id: 3,
            active_term_id: 3,
            term_length: TERM_MIN_LENGTH,
            mtu: 1024,
            ttl: 0,
        }
    }

    #[test]
    fn setup_decodes_with_announced_geometry() {
        let mut buf = Vec::new();
        encode_setup(&setup(), &mut buf);
        assert_eq!(buf.len(), SETUP_LENGTH);

        assert_eq!(decode_frame(&buf).unwrap(), Frame::Setup(setup()));
    }

    #[test]
    fn data_frame_exposes_payload() {
        let header = DataHeader {
            flags: flags::UNFRAGMENTED,
            term_offset: 64,
            session_id: SessionId::new(1),
            stream_id: StreamId::new(10),
            term_id: 3,
            reserved_value: 0,
        };
        let mut buf = Vec::new();
        encode_data(&header, &[7u8; 100], &mut buf).unwrap();

        let frame = decode_frame(&buf).unwrap();
        match frame {
            Frame::Data { header: decoded, frame: bytes } => {
                assert_eq!(decoded, header);
                assert_eq!(bytes.len(), DATA_HEADER_LENGTH + 100);
            }
            other => panic!("expected DATA, got {other:?}"),
        }
        assert_eq!(frame.payload(), &[7u8; 100][..]);
    }

    #[test]
    fn trailing_bytes_after_frame_length_are_excluded() {
        let header = DataHeader {
            flags: 0,
            term_offset: 0,
            session_id: SessionId::new(5),
            stream_id: StreamId::new(6),
            term_id: 0,
            reserved_value: 0,
        };
        let mut buf = Vec::new();
        encode_data(&header, &[], &mut buf).unwrap();
        buf.extend_from_slice(&[0xAA; 16]);

        let frame = decode_frame(&buf).unwrap();
        assert!(frame.payload().is_empty(), "heartbeat carries no payload");
    }

    #[test]
    fn setup_eliciting_status_message_sets_flag() {
        let sm = StatusMessage::setup_eliciting(SessionId::new(1), StreamId::new(10), 99);
        let mut buf = Vec::new();
        encode_status_message(&sm, &mut buf);
        assert_eq!(buf.len(), STATUS_MESSAGE_LENGTH);
        assert_eq!(buf[5], flags::SEND_SETUP);

        match decode_frame(&buf).unwrap() {
            Frame::StatusMessage(decoded) => {
                assert!(decoded.is_setup_eliciting());
                assert_eq!(decoded.receiver_id, 99);
            }
            other => panic!("expected SM, got {other:?}"),
        }
    }

    #[test]
    fn setup_with_bad_term_length_is_rejected() {
        let mut bad = setup();
        bad.term_length = TERM_MIN_LENGTH + 1;
        let mut buf = Vec::new();
        encode_setup(&bad, &mut buf);

        assert_eq!(
            decode_frame(&buf),
            Err(ProtocolError::InvalidTermLength(TERM_MIN_LENGTH + 1))
        );
    }

    #[test]
    fn setup_with_unaligned_mtu_is_rejected() {
        let mut bad = setup();
        bad.mtu = 1000;
        let mut buf = Vec::new();
        encode_setup(&bad, &mut buf);

        assert_eq!(decode_frame(&buf), Err(ProtocolError::InvalidMtu(1000)));
    }

    #[test]
    fn truncated_setup_is_rejected() {
        let mut buf = Vec::new();
        encode_setup(&setup(), &mut buf);

        assert_eq!(
            decode_frame(&buf[..20]),
            Err(ProtocolError::BufferTooSmall {
                need: SETUP_LENGTH,
                have: 20
            })
        );
    }

    #[test]
    fn frame_length_beyond_datagram_is_rejected() {
        let mut buf = Vec::new();
        encode_setup(&setup(), &mut buf);
        buf[..4].copy_from_slice(&64i32.to_le_bytes());

        assert_eq!(decode_frame(&buf), Err(ProtocolError::InvalidFrameLength(64)));
    }

    #[test]
    fn unknown_type_and_version() {
        let unknown = [8, 0, 0, 0, 0, 0, 0x42, 0];
        assert_eq!(decode_frame(&unknown), Err(ProtocolError::UnknownFrameType(0x42)));

        let future = [8, 0, 0, 0, 1, 0, 0, 0];
        assert_eq!(decode_frame(&future), Err(ProtocolError::UnsupportedVersion(1)));

        assert!(matches!(
            decode_frame(&[]),
            Err(ProtocolError::BufferTooSmall { need: 4, have: 0 })
        ));
    }

    #[test]
    fn pad_frame() {
        let pad = [8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_frame(&pad), Ok(Frame::Pad));
    }

    #[test]
    fn term_length_bounds() {
        assert!(validate_term_length(TERM_MIN_LENGTH).is_ok());
        assert!(validate_term_length(TERM_MAX_LENGTH).is_ok());
        assert!(validate_term_length(TERM_MIN_LENGTH / 2).is_err());
        assert!(validate_term_length(TERM_MAX_LENGTH.wrapping_mul(2)).is_err());
    }
}
