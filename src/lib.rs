//! A reliable, multiplexed session layer for tunneled transports.
//!
//! Trellis runs sessions on top of an *underlay* connection: either a
//! stream transport that already guarantees order and delivery, or a
//! datagram transport that guarantees neither. Each [`Session`] gives the
//! application a bidirectional, message-preserving byte channel; on the
//! wire it is framed into numbered [`Segment`]s carrying data,
//! acknowledgements, and lifecycle control. A single process may run many
//! sessions over one underlay, each identified by a session ID.
//!
//! # Organization
//!
//! - [`Message`] is the zero-copy byte container payloads travel in.
//! - [`Segment`] and [`ProtocolKind`] model the wire unit.
//! - [`SegmentBuffer`] is the bounded, sequence-ordered container the
//!   send and receive pipelines are built from.
//! - [`Session`] is the application-facing channel and owns the two
//!   background loops.
//! - [`Underlay`] is the contract a transport implements to carry
//!   sessions.
//! - [`RttStats`] and [`Cubic`] drive retransmission timing and the send
//!   window on unreliable underlays.
//!
//! # A session's life
//!
//! A session is created with an ID and a [`Role`], attached to an
//! underlay, and started. The first write performs the session-open
//! handshake, piggybacking the payload when it fits in one segment. Data
//! writes are fragmented to the underlay's budget and reassembled on the
//! far side, so every read returns exactly one written message. Closing
//! is a request/response handshake and is idempotent.

pub mod buffer;
pub mod cubic;
pub mod message;
pub mod rtt;
pub mod segment;
pub mod session;
pub mod signal;
pub mod underlay;

pub use buffer::{BufferClosed, SegmentBuffer, SEGMENT_BUFFER_CAPACITY};
pub use cubic::{Cubic, MAX_WINDOW, MIN_WINDOW};
pub use message::Message;
pub use rtt::{RttStats, DEFAULT_MAX_ACK_DELAY, DEFAULT_RTO_MULTIPLIER};
pub use segment::{
    ControlHeader, DataHeader, Metadata, ProtocolKind, Segment, StatusCode, UnknownProtocol,
};
pub use session::{
    Role, Session, SessionConfig, SessionError, SessionState, INBOUND_CHANNEL_CAPACITY,
    SEGMENT_POLL_INTERVAL,
};
pub use signal::Signal;
pub use underlay::{IpVersion, SharedUnderlay, TransportProtocol, Underlay, UDP_HEADER_LEN};
