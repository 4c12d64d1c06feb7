//! The on-wire unit of the session protocol and its typed metadata.

use std::time::Instant;

use crate::message::Message;
use crate::session::Role;

/// The protocol tag of a segment. The discriminants are the wire values;
/// 0 and 1 are reserved by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolKind {
    /// A client asks the server to open a session.
    OpenSessionRequest = 2,
    /// The server's answer to an open request.
    OpenSessionResponse = 3,
    /// Application data flowing client to server.
    DataClientToServer = 4,
    /// Application data flowing server to client.
    DataServerToClient = 5,
    /// A pure acknowledgement flowing client to server.
    AckClientToServer = 6,
    /// A pure acknowledgement flowing server to client.
    AckServerToClient = 7,
    /// Either side asks to close the session.
    CloseSessionRequest = 8,
    /// The answer to a close request.
    CloseSessionResponse = 9,
}

/// Error produced when decoding a byte that is not a known protocol tag.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown protocol tag {0}")]
pub struct UnknownProtocol(pub u8);

impl ProtocolKind {
    /// The tag's value on the wire.
    pub const fn wire_value(self) -> u8 {
        self as u8
    }

    /// Whether this tag carries application data.
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            ProtocolKind::DataClientToServer | ProtocolKind::DataServerToClient
        )
    }

    /// Whether this tag is a pure acknowledgement.
    pub const fn is_ack(self) -> bool {
        matches!(
            self,
            ProtocolKind::AckClientToServer | ProtocolKind::AckServerToClient
        )
    }

    /// Whether this tag opens a session.
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            ProtocolKind::OpenSessionRequest | ProtocolKind::OpenSessionResponse
        )
    }

    /// Whether this tag belongs to the open or close handshake.
    pub const fn is_session_control(self) -> bool {
        matches!(
            self,
            ProtocolKind::OpenSessionRequest
                | ProtocolKind::OpenSessionResponse
                | ProtocolKind::CloseSessionRequest
                | ProtocolKind::CloseSessionResponse
        )
    }

    /// Whether a session with the given role may accept an inbound segment
    /// with this tag. A client hears the server-to-client tags and a server
    /// hears the client-to-server tags; close segments flow both ways.
    pub const fn valid_for(self, role: Role) -> bool {
        match role {
            Role::Client => matches!(
                self,
                ProtocolKind::OpenSessionResponse
                    | ProtocolKind::DataServerToClient
                    | ProtocolKind::AckServerToClient
                    | ProtocolKind::CloseSessionRequest
                    | ProtocolKind::CloseSessionResponse
            ),
            Role::Server => matches!(
                self,
                ProtocolKind::OpenSessionRequest
                    | ProtocolKind::DataClientToServer
                    | ProtocolKind::AckClientToServer
                    | ProtocolKind::CloseSessionRequest
                    | ProtocolKind::CloseSessionResponse
            ),
        }
    }
}

impl TryFrom<u8> for ProtocolKind {
    type Error = UnknownProtocol;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(ProtocolKind::OpenSessionRequest),
            3 => Ok(ProtocolKind::OpenSessionResponse),
            4 => Ok(ProtocolKind::DataClientToServer),
            5 => Ok(ProtocolKind::DataServerToClient),
            6 => Ok(ProtocolKind::AckClientToServer),
            7 => Ok(ProtocolKind::AckServerToClient),
            8 => Ok(ProtocolKind::CloseSessionRequest),
            9 => Ok(ProtocolKind::CloseSessionResponse),
            other => Err(UnknownProtocol(other)),
        }
    }
}

/// Status carried by the open and close handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    /// The request was accepted.
    Ok = 0,
    /// The peer refused the request.
    Rejected = 1,
}

/// Typed segment metadata. Control segments belong to the open and close
/// handshakes; data segments carry application payload or a pure
/// acknowledgement. The protocol tag is stored redundantly inside each
/// variant and is validated against it by the constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    /// Open or close handshake header.
    Control(ControlHeader),
    /// Data or acknowledgement header.
    Data(DataHeader),
}

/// Header fields of an open or close segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub kind: ProtocolKind,
    pub session_id: u32,
    pub seq: u32,
    pub status: StatusCode,
    pub payload_len: u16,
}

/// Header fields of a data or acknowledgement segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub kind: ProtocolKind,
    pub session_id: u32,
    pub seq: u32,
    /// Cumulative acknowledgement cursor: every peer sequence number below
    /// this value has been received.
    pub unack: u32,
    /// Remaining receive-buffer capacity advertised to the peer.
    pub window: u16,
    /// Position within one application message, counting down; 0 marks the
    /// final fragment.
    pub fragment: u8,
    pub payload_len: u16,
}

/// A segment of the session protocol: typed metadata plus payload, along
/// with transmit bookkeeping used by the retransmission pipeline. The
/// bookkeeping never travels on the wire.
#[derive(Debug, Clone)]
pub struct Segment {
    pub metadata: Metadata,
    pub payload: Message,
    /// How many times the segment has been handed to the underlay.
    pub(crate) tx_count: u32,
    /// When the segment was most recently handed to the underlay.
    pub(crate) last_tx: Option<Instant>,
}

impl Segment {
    /// Builds an open or close handshake segment.
    ///
    /// Panics if `kind` is not a session-control tag or the payload exceeds
    /// what one segment can describe; both are construction bugs.
    pub fn control(
        kind: ProtocolKind,
        session_id: u32,
        seq: u32,
        status: StatusCode,
        payload: Message,
    ) -> Self {
        assert!(kind.is_session_control(), "{kind:?} is not a control tag");
        let payload_len = checked_payload_len(&payload);
        Self {
            metadata: Metadata::Control(ControlHeader {
                kind,
                session_id,
                seq,
                status,
                payload_len,
            }),
            payload,
            tx_count: 0,
            last_tx: None,
        }
    }

    /// Builds a data segment carrying one fragment of an application
    /// message.
    ///
    /// Panics if `kind` is not a data tag or the payload exceeds what one
    /// segment can describe; both are construction bugs.
    pub fn data(
        kind: ProtocolKind,
        session_id: u32,
        seq: u32,
        unack: u32,
        window: u16,
        fragment: u8,
        payload: Message,
    ) -> Self {
        assert!(kind.is_data(), "{kind:?} is not a data tag");
        let payload_len = checked_payload_len(&payload);
        Self {
            metadata: Metadata::Data(DataHeader {
                kind,
                session_id,
                seq,
                unack,
                window,
                fragment,
                payload_len,
            }),
            payload,
            tx_count: 0,
            last_tx: None,
        }
    }

    /// Builds a pure acknowledgement segment.
    ///
    /// Panics if `kind` is not an acknowledgement tag.
    pub fn ack(kind: ProtocolKind, session_id: u32, seq: u32, unack: u32, window: u16) -> Self {
        assert!(kind.is_ack(), "{kind:?} is not an ack tag");
        Self {
            metadata: Metadata::Data(DataHeader {
                kind,
                session_id,
                seq,
                unack,
                window,
                fragment: 0,
                payload_len: 0,
            }),
            payload: Message::default(),
            tx_count: 0,
            last_tx: None,
        }
    }

    /// The segment's protocol tag.
    pub fn kind(&self) -> ProtocolKind {
        match &self.metadata {
            Metadata::Control(header) => header.kind,
            Metadata::Data(header) => header.kind,
        }
    }

    /// The session the segment belongs to.
    pub fn session_id(&self) -> u32 {
        match &self.metadata {
            Metadata::Control(header) => header.session_id,
            Metadata::Data(header) => header.session_id,
        }
    }

    /// The segment's sequence number. Both metadata variants carry one, so
    /// it is always retrievable.
    pub fn seq(&self) -> u32 {
        match &self.metadata {
            Metadata::Control(header) => header.seq,
            Metadata::Data(header) => header.seq,
        }
    }

    /// The fragment countdown. Control segments are never fragmented and
    /// report 0, terminating reassembly.
    pub fn fragment(&self) -> u8 {
        match &self.metadata {
            Metadata::Control(_) => 0,
            Metadata::Data(header) => header.fragment,
        }
    }

    /// The cumulative acknowledgement cursor, if the segment carries one.
    pub fn unack(&self) -> Option<u32> {
        match &self.metadata {
            Metadata::Control(_) => None,
            Metadata::Data(header) => Some(header.unack),
        }
    }

    /// The advertised receive window, if the segment carries one.
    pub fn window(&self) -> Option<u16> {
        match &self.metadata {
            Metadata::Control(_) => None,
            Metadata::Data(header) => Some(header.window),
        }
    }

    /// The payload length recorded in the metadata.
    pub fn payload_len(&self) -> u16 {
        match &self.metadata {
            Metadata::Control(header) => header.payload_len,
            Metadata::Data(header) => header.payload_len,
        }
    }
}

fn checked_payload_len(payload: &Message) -> u16 {
    u16::try_from(payload.len()).expect("segment payload exceeds the wire length field")
}
