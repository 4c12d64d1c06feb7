//! The transport contract beneath a session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::segment::Segment;

/// IP version of the underlay's network path; sizes fragment budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Bytes consumed by the IP header on this path.
    pub const fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => 20,
            IpVersion::V6 => 40,
        }
    }
}

/// Bytes consumed by a UDP header.
pub const UDP_HEADER_LEN: usize = 8;

/// How an underlay moves bytes.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// The underlay itself guarantees ordered, reliable delivery.
    ReliableStream,
    /// The underlay delivers datagrams that may be lost, duplicated, or
    /// reordered.
    UnreliableDatagram,
}

/// A connection the session layer runs on top of.
///
/// The underlay owns framing: [`write_segment`](Underlay::write_segment)
/// receives one segment value and is responsible for encoding it and
/// putting it on the network, whatever that means for the transport. When
/// several sessions share one underlay, the layer above the sessions
/// serializes their writes.
#[async_trait]
pub trait Underlay: Send + Sync + 'static {
    /// The IP version of the path.
    fn ip_version(&self) -> IpVersion;

    /// Whether the transport is a reliable stream or an unreliable
    /// datagram carrier.
    fn transport_protocol(&self) -> TransportProtocol;

    /// The local endpoint address.
    fn local_addr(&self) -> SocketAddr;

    /// The remote endpoint address.
    fn remote_addr(&self) -> SocketAddr;

    /// Frames and emits a single segment.
    async fn write_segment(&self, segment: &Segment) -> io::Result<()>;
}

/// A shared handle to an [`Underlay`].
pub type SharedUnderlay = Arc<dyn Underlay>;
