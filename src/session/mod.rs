//! A reliable, multiplexed session over a lower transport.
//!
//! A [`Session`] presents a bidirectional, message-preserving byte channel
//! to the application. On the wire it is framed into numbered segments
//! carrying data, acknowledgements, and lifecycle control. Many sessions
//! may share one underlay; the layer above them demultiplexes inbound
//! segments into each session's bounded channel and serializes outbound
//! writes.
//!
//! Each session runs two background tasks: an input loop that classifies
//! inbound segments and lifts ordered payloads toward the reader, and an
//! output loop that drains the send path to the underlay. The application
//! side and the loops meet only at the four segment buffers and the
//! lifecycle signals, so neither ever blocks the other on a lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::SegmentBuffer;
use crate::cubic::Cubic;
use crate::message::Message;
use crate::rtt::RttStats;
use crate::segment::{ProtocolKind, Segment, StatusCode};
use crate::signal::Signal;
use crate::underlay::{SharedUnderlay, TransportProtocol, UDP_HEADER_LEN};

mod input;
mod output;
mod state;

pub use state::SessionState;
use state::StateCell;

/// Interval at which the output loop polls the send path.
pub const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the inbound segment channel between the demultiplexer and
/// the session.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Which end of the session this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The handshake tag this role emits on its first write.
    pub(crate) const fn open_kind(self) -> ProtocolKind {
        match self {
            Role::Client => ProtocolKind::OpenSessionRequest,
            Role::Server => ProtocolKind::OpenSessionResponse,
        }
    }

    /// The data tag this role emits.
    pub(crate) const fn data_kind(self) -> ProtocolKind {
        match self {
            Role::Client => ProtocolKind::DataClientToServer,
            Role::Server => ProtocolKind::DataServerToClient,
        }
    }

    /// The acknowledgement tag this role emits.
    pub(crate) const fn ack_kind(self) -> ProtocolKind {
        match self {
            Role::Client => ProtocolKind::AckClientToServer,
            Role::Server => ProtocolKind::AckServerToClient,
        }
    }
}

/// Limits handed down by the framing layer.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// The L2 maximum transmission unit of the path.
    pub mtu: u16,
    /// The largest payload a single write may carry.
    pub max_pdu: usize,
    /// The largest payload a single segment may carry.
    pub max_fragment_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            max_pdu: 65536,
            max_fragment_size: 16384,
        }
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation needs an attached session.
    #[error("session is not attached to an underlay")]
    NotReady,
    /// The session is already closed.
    #[error("session is closed")]
    ClosedPipe,
    /// The caller's buffer cannot hold the assembled message. Retryable:
    /// the message stays staged for a larger buffer.
    #[error("message of {need} bytes does not fit in a {have} byte buffer")]
    ShortBuffer { need: usize, have: usize },
    /// The payload exceeds what a single write may carry.
    #[error("payload of {len} bytes exceeds the write limit of {max} bytes")]
    ShortWrite { len: usize, max: usize },
    /// An inbound segment carried a tag the session's role never accepts.
    /// The segment is dropped; the pipeline continues.
    #[error("protocol {0:?} is not valid for this session's role")]
    InvalidProtocol(ProtocolKind),
    /// The underlay transport is not one the session pipelines understand.
    /// Fatal to the session.
    #[error("unsupported transport protocol")]
    UnsupportedTransport,
    /// The underlay failed while writing a segment. Fatal to the session.
    #[error("underlay write failed: {0}")]
    Io(#[from] std::io::Error),
    /// The receive path is finished; a normal end of stream.
    #[error("end of stream")]
    Eof,
    /// The operation is not part of the session contract.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// One end of a reliable, multiplexed session.
///
/// Created in the `Init` state, a session is bound to its transport with
/// [`attach`](Session::attach) and its background loops are spawned with
/// [`start`](Session::start). The first write performs the session-open
/// handshake. Reads and writes are serialized per direction; a read and a
/// write may run concurrently, but never two of either.
pub struct Session {
    id: u32,
    role: Role,
    config: SessionConfig,
    underlay: RwLock<Option<SharedUnderlay>>,
    state: StateCell,

    /// Outbound segments not yet handed to the underlay.
    send_queue: SegmentBuffer,
    /// Outbound segments sent but not yet acknowledged (unreliable
    /// transport only).
    send_buf: SegmentBuffer,
    /// Inbound segments waiting to be put in order (unreliable transport
    /// only).
    recv_buf: SegmentBuffer,
    /// Inbound segments in order, ready for the reader.
    recv_queue: SegmentBuffer,

    inbound_tx: mpsc::Sender<Segment>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Segment>>,

    /// Next outbound sequence number.
    next_seq: AtomicU32,
    /// Next inbound sequence number the session expects.
    next_recv: AtomicU32,
    /// Oldest outbound sequence number the peer has not acknowledged.
    unack_seq: AtomicU32,

    /// A message assembled but not yet taken by the reader.
    carryover: Mutex<Message>,
    /// When an acknowledgement cursor last went out, in any segment.
    last_ack_tx: Mutex<Option<Instant>>,

    rtt: RttStats,
    cubic: Cubic,

    read_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,

    /// Raised when the session is attached and usable.
    ready: Signal,
    /// Raised when the open handshake completes.
    established: Signal,
    /// Raised when the close handshake concludes (or the session is torn
    /// down without one).
    completed: Signal,
    /// Raised when the session is finished; both loops observe it and
    /// exit.
    done: Signal,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Session {
    /// Creates a session in the `Init` state.
    pub fn new(id: u32, role: Role, config: SessionConfig) -> Self {
        assert!(config.max_fragment_size > 0, "fragment size must be positive");
        assert!(
            config.max_fragment_size <= usize::from(u16::MAX),
            "fragment size exceeds the wire length field"
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            id,
            role,
            config,
            underlay: RwLock::new(None),
            state: StateCell::new(),
            send_queue: SegmentBuffer::new(),
            send_buf: SegmentBuffer::new(),
            recv_buf: SegmentBuffer::new(),
            recv_queue: SegmentBuffer::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            next_seq: AtomicU32::new(0),
            next_recv: AtomicU32::new(0),
            unack_seq: AtomicU32::new(0),
            carryover: Mutex::new(Message::default()),
            last_ack_tx: Mutex::new(None),
            rtt: RttStats::new(),
            cubic: Cubic::new(),
            read_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            ready: Signal::new(),
            established: Signal::new(),
            completed: Signal::new(),
            done: Signal::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// A random session ID for the multiplexing layer to assign.
    pub fn random_id() -> u32 {
        rand::random()
    }

    /// The session's ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Which end of the session this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Binds the session to its underlay and makes it ready for use.
    /// Attaching after the handshake has begun is a programming error.
    pub fn attach(&self, underlay: SharedUnderlay) -> Result<(), SessionError> {
        if self.state.get() >= SessionState::Closing {
            return Err(SessionError::ClosedPipe);
        }
        *self.underlay.write().unwrap() = Some(underlay);
        self.state.forward_to(SessionState::Attached);
        self.ready.fire();
        Ok(())
    }

    /// Spawns the input and output loops. Both exit when `cancel` fires or
    /// the session finishes.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let session = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move { session.run_input_loop(token).await });
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_output_loop(cancel).await });
    }

    /// The sender half of the session's inbound segment channel, for the
    /// demultiplexer to deliver decoded segments through.
    pub fn inbound_sender(&self) -> mpsc::Sender<Segment> {
        self.inbound_tx.clone()
    }

    /// Resolves when the open handshake completes.
    pub async fn wait_established(&self) {
        self.established.fired().await;
    }

    /// Resolves when the session is finished.
    pub async fn wait_done(&self) {
        self.done.fired().await;
    }

    /// The local address of the underlay, once attached.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.underlay
            .read()
            .unwrap()
            .as_ref()
            .map(|underlay| underlay.local_addr())
    }

    /// The remote address of the underlay, once attached.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.underlay
            .read()
            .unwrap()
            .as_ref()
            .map(|underlay| underlay.remote_addr())
    }

    /// Deadlines are not part of the session contract.
    pub fn set_deadline(&self, _deadline: Instant) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("deadline"))
    }

    /// Deadlines are not part of the session contract.
    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("read deadline"))
    }

    /// Deadlines are not part of the session contract.
    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("write deadline"))
    }

    /// The session's round-trip statistics; the retransmission-timeout
    /// multiplier and acknowledgement delay bound are settable through it.
    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    /// The session's send algorithm; the output pipeline keeps the
    /// retransmission buffer within its window.
    pub fn send_algorithm(&self) -> &Cubic {
        &self.cubic
    }

    /// Total payload bytes accepted by [`write`](Session::write).
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total payload bytes handed to [`read`](Session::read) callers.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Reads one application message into `buf`, preserving message
    /// boundaries: the call returns exactly one message, or
    /// [`SessionError::ShortBuffer`] if `buf` cannot hold it, in which
    /// case the message stays staged for a retry with a larger buffer.
    /// A finished receive path surfaces as [`SessionError::Eof`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let _guard = self.read_lock.lock().await;
        self.check_io_allowed()?;

        if self.carryover.lock().unwrap().is_empty() {
            let message = self.next_message().await?;
            *self.carryover.lock().unwrap() = message;
        }

        let mut staged = self.carryover.lock().unwrap();
        if staged.len() > buf.len() {
            return Err(SessionError::ShortBuffer {
                need: staged.len(),
                have: buf.len(),
            });
        }
        let count = staged.copy_to(buf);
        staged.clear();
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Removes segments from the receive queue until a whole message has
    /// been assembled.
    async fn next_message(&self) -> Result<Message, SessionError> {
        let mut assembled = Message::default();
        loop {
            let Some(segment) = self.recv_queue.delete_min_blocking().await else {
                return Err(SessionError::Eof);
            };

            // A client learns that the handshake completed from the first
            // response segment it reads.
            if self.role == Role::Client
                && segment.kind() == ProtocolKind::OpenSessionResponse
                && matches!(
                    self.state.get(),
                    SessionState::Attached | SessionState::Opening
                )
            {
                self.state.forward_to(SessionState::Established);
                self.established.fire();
            }

            let control = segment.kind().is_session_control();
            let last = segment.fragment() == 0;
            assembled.concatenate(segment.payload);
            if last {
                if control && assembled.is_empty() {
                    // A bare handshake segment is pure signaling, not an
                    // application message.
                    continue;
                }
                return Ok(assembled);
            }
        }
    }

    /// Writes one application message of at most
    /// [`SessionConfig::max_pdu`] bytes.
    ///
    /// The first write on an attached session performs the open handshake:
    /// if the payload fits in a single segment it rides along in the
    /// handshake segment, otherwise the handshake segment goes out bare
    /// and the payload follows as ordinary data segments in the same call.
    /// Larger payloads are split into fragments counting down to 0 so the
    /// receiver knows where the message ends.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, SessionError> {
        let _guard = self.write_lock.lock().await;
        self.check_io_allowed()?;
        if buf.len() > self.config.max_pdu {
            return Err(SessionError::ShortWrite {
                len: buf.len(),
                max: self.config.max_pdu,
            });
        }
        let underlay = self.underlay()?;
        let fragment_size = self.fragment_size(&underlay);
        let total = buf.len();
        let mut payload = Message::new(buf.to_vec());

        if self.state.get() == SessionState::Attached {
            let piggyback = payload.len() <= fragment_size;
            let open_payload = if piggyback {
                payload.cut(payload.len())
            } else {
                Message::default()
            };
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let segment = Segment::control(
                self.role.open_kind(),
                self.id,
                seq,
                StatusCode::Ok,
                open_payload,
            );
            self.enqueue(segment).await?;
            match self.role {
                Role::Client => {
                    self.state.forward_to(SessionState::Opening);
                }
                Role::Server => {
                    self.state.forward_to(SessionState::Established);
                    self.established.fire();
                }
            }
            if piggyback {
                self.bytes_sent.fetch_add(total as u64, Ordering::Relaxed);
                return Ok(total);
            }
        }

        let count = payload.len().div_ceil(fragment_size).max(1);
        if count > usize::from(u8::MAX) + 1 {
            return Err(SessionError::ShortWrite {
                len: total,
                max: fragment_size * (usize::from(u8::MAX) + 1),
            });
        }
        for index in 0..count {
            let take = payload.len().min(fragment_size);
            let fragment = payload.cut(take);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let segment = Segment::data(
                self.role.data_kind(),
                self.id,
                seq,
                self.next_recv.load(Ordering::Relaxed),
                self.recv_buf.remaining() as u16,
                (count - index - 1) as u8,
                fragment,
            );
            self.enqueue(segment).await?;
        }
        self.note_cursor_carried();
        self.bytes_sent.fetch_add(total as u64, Ordering::Relaxed);
        Ok(total)
    }

    /// Closes the session. Idempotent: once a close is in flight or the
    /// session has finished, further calls succeed without emitting
    /// another close request.
    pub async fn close(&self) -> Result<(), SessionError> {
        let _write = self.write_lock.lock().await;
        let _read = self.read_lock.lock().await;

        let state = self.state.get();
        if state >= SessionState::Closing {
            if self.completed.is_fired() {
                self.terminate();
            }
            return Ok(());
        }
        if state == SessionState::Init {
            // Never attached; nothing to tell the peer.
            self.terminate();
            return Ok(());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let segment = Segment::control(
            ProtocolKind::CloseSessionRequest,
            self.id,
            seq,
            StatusCode::Ok,
            Message::default(),
        );
        self.enqueue(segment).await?;
        self.state.forward_to(SessionState::Closing);
        Ok(())
    }

    /// Finishes the session: raises the completion and done signals,
    /// advances to `Closed`, and closes every buffer so blocked readers,
    /// writers, and loops wake up. Idempotent.
    pub(crate) fn terminate(&self) {
        self.completed.fire();
        self.state.forward_to(SessionState::Closed);
        self.send_queue.close();
        self.send_buf.close();
        self.recv_buf.close();
        self.recv_queue.close();
        self.done.fire();
    }

    fn check_io_allowed(&self) -> Result<(), SessionError> {
        let state = self.state.get();
        if state < SessionState::Attached {
            return Err(SessionError::NotReady);
        }
        if state >= SessionState::Closed {
            return Err(SessionError::ClosedPipe);
        }
        Ok(())
    }

    pub(crate) fn underlay(&self) -> Result<SharedUnderlay, SessionError> {
        self.underlay
            .read()
            .unwrap()
            .clone()
            .ok_or(SessionError::NotReady)
    }

    /// The largest payload one segment may carry on the attached underlay.
    fn fragment_size(&self, underlay: &SharedUnderlay) -> usize {
        let transport = underlay.transport_protocol();
        if transport == TransportProtocol::ReliableStream {
            self.config.max_fragment_size
        } else {
            // Datagram segments must fit the path MTU alongside the IP and
            // UDP headers.
            let overhead = underlay.ip_version().header_len() + UDP_HEADER_LEN;
            let budget = usize::from(self.config.mtu).saturating_sub(overhead);
            self.config.max_fragment_size.min(budget.max(1))
        }
    }

    async fn enqueue(&self, segment: Segment) -> Result<(), SessionError> {
        self.send_queue
            .insert(segment)
            .await
            .map_err(|_| SessionError::ClosedPipe)
    }

    /// Notes that an outbound segment just carried the acknowledgement
    /// cursor, so the input pipeline can withhold redundant pure acks.
    pub(crate) fn note_cursor_carried(&self) {
        *self.last_ack_tx.lock().unwrap() = Some(Instant::now());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::underlay::{IpVersion, Underlay};
    use async_trait::async_trait;
    use std::io;

    /// An underlay that records every segment written to it.
    pub(crate) struct MockUnderlay {
        transport: TransportProtocol,
        pub written: Mutex<Vec<Segment>>,
    }

    impl MockUnderlay {
        pub fn reliable() -> Arc<Self> {
            Arc::new(Self {
                transport: TransportProtocol::ReliableStream,
                written: Mutex::new(Vec::new()),
            })
        }

        pub fn unreliable() -> Arc<Self> {
            Arc::new(Self {
                transport: TransportProtocol::UnreliableDatagram,
                written: Mutex::new(Vec::new()),
            })
        }

        pub fn written_kinds(&self) -> Vec<ProtocolKind> {
            self.written.lock().unwrap().iter().map(Segment::kind).collect()
        }
    }

    #[async_trait]
    impl Underlay for MockUnderlay {
        fn ip_version(&self) -> IpVersion {
            IpVersion::V4
        }

        fn transport_protocol(&self) -> TransportProtocol {
            self.transport
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:4000".parse().unwrap()
        }

        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:4001".parse().unwrap()
        }

        async fn write_segment(&self, segment: &Segment) -> io::Result<()> {
            self.written.lock().unwrap().push(segment.clone());
            Ok(())
        }
    }

    /// A client session attached to the given underlay.
    pub(crate) fn attached_client(underlay: Arc<MockUnderlay>) -> Session {
        let session = Session::new(77, Role::Client, SessionConfig::default());
        session.attach(underlay).unwrap();
        session
    }

    /// A server session attached to the given underlay.
    pub(crate) fn attached_server(underlay: Arc<MockUnderlay>) -> Session {
        let session = Session::new(77, Role::Server, SessionConfig::default());
        session.attach(underlay).unwrap();
        session
    }
}
