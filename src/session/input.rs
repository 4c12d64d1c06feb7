//! The inbound half of the session: classification and delivery.
//!
//! One segment at a time arrives from the demultiplexer through the
//! bounded inbound channel. The handler validates the protocol tag against
//! the session's role, then applies the delivery policy the underlay
//! calls for. A reliable underlay has already ordered and deduplicated
//! the stream, so data goes straight to the receive queue and
//! acknowledgements are meaningless. An unreliable underlay delivers
//! anything in any order, so data is staged in the receive buffer and
//! lifted into the receive queue one contiguous sequence number at a
//! time, while acknowledgements purge the retransmission buffer.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::segment::{ProtocolKind, Segment, StatusCode};
use crate::underlay::TransportProtocol;

use super::{Session, SessionError};

impl Session {
    /// Runs the input loop until cancellation, session completion, or a
    /// fatal pipeline error.
    pub(crate) async fn run_input_loop(&self, cancel: CancellationToken) {
        // Nothing can arrive before the demultiplexer attaches the session.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.done.fired() => return,
            _ = self.ready.fired() => {}
        }

        let mut inbound = self.inbound_rx.lock().await;
        loop {
            let segment = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.done.fired() => break,
                received = inbound.recv() => match received {
                    Some(segment) => segment,
                    None => break,
                },
            };
            match self.handle_inbound(segment).await {
                Ok(()) => {}
                Err(SessionError::InvalidProtocol(kind)) => {
                    tracing::debug!(
                        session = self.id,
                        kind = ?kind,
                        "dropping segment with protocol invalid for role"
                    );
                }
                Err(err) => {
                    if !self.done.is_fired() {
                        tracing::error!(session = self.id, %err, "input pipeline failed");
                    }
                    self.terminate();
                    break;
                }
            }
        }
    }

    /// Classifies and delivers one inbound segment.
    ///
    /// An [`SessionError::InvalidProtocol`] return reports a segment whose
    /// tag the session's role never accepts; the segment has been dropped
    /// and the pipeline may continue. Every other error is fatal to the
    /// session.
    pub(crate) async fn handle_inbound(&self, segment: Segment) -> Result<(), SessionError> {
        let kind = segment.kind();
        if !kind.valid_for(self.role) {
            return Err(SessionError::InvalidProtocol(kind));
        }
        let underlay = self.underlay()?;
        let transport = underlay.transport_protocol();
        let reliable = if transport == TransportProtocol::ReliableStream {
            true
        } else if transport == TransportProtocol::UnreliableDatagram {
            false
        } else {
            return Err(SessionError::UnsupportedTransport);
        };

        match kind {
            ProtocolKind::OpenSessionRequest
            | ProtocolKind::OpenSessionResponse
            | ProtocolKind::DataClientToServer
            | ProtocolKind::DataServerToClient => self.handle_data(segment, reliable).await,

            ProtocolKind::AckClientToServer | ProtocolKind::AckServerToClient => {
                // A reliable underlay never loses segments, so there is
                // nothing to acknowledge.
                if !reliable {
                    self.handle_ack(&segment);
                }
                Ok(())
            }

            ProtocolKind::CloseSessionRequest => {
                // Answer on the side channel, best effort: the close is
                // honored whether or not the response makes it out.
                let response = Segment::control(
                    ProtocolKind::CloseSessionResponse,
                    self.id,
                    self.next_seq.load(Ordering::Relaxed),
                    StatusCode::Ok,
                    Message::default(),
                );
                if let Err(err) = underlay.write_segment(&response).await {
                    tracing::warn!(session = self.id, %err, "failed to write close response");
                }
                self.terminate();
                Ok(())
            }

            ProtocolKind::CloseSessionResponse => {
                self.terminate();
                Ok(())
            }
        }
    }

    /// Delivers an open or data segment toward the reader.
    async fn handle_data(&self, segment: Segment, reliable: bool) -> Result<(), SessionError> {
        if reliable {
            return self
                .recv_queue
                .insert(segment)
                .await
                .map_err(|_| SessionError::ClosedPipe);
        }

        // Data segments double as acknowledgements of the peer's receive
        // progress.
        self.handle_ack(&segment);

        if segment.seq() >= self.next_recv.load(Ordering::Relaxed) {
            self.recv_buf
                .insert(segment)
                .await
                .map_err(|_| SessionError::ClosedPipe)?;
            self.lift_ordered().await?;
        } else {
            tracing::trace!(session = self.id, seq = segment.seq(), "dropping duplicate segment");
        }

        self.maybe_send_ack().await
    }

    /// Moves every segment that is now in order from the receive buffer to
    /// the receive queue, advancing `next_recv` once per unique sequence
    /// number and discarding duplicates.
    async fn lift_ordered(&self) -> Result<(), SessionError> {
        loop {
            let next = self.next_recv.load(Ordering::Relaxed);
            let Some(minimum) = self.recv_buf.delete_min_if(|segment| segment.seq() <= next)
            else {
                return Ok(());
            };
            if minimum.seq() == next {
                self.recv_queue
                    .insert(minimum)
                    .await
                    .map_err(|_| SessionError::ClosedPipe)?;
                self.next_recv
                    .store(next.wrapping_add(1), Ordering::Relaxed);
            }
            // A minimum below `next` is a duplicate of something already
            // delivered; it is dropped on the floor.
        }
    }

    /// Applies the cumulative acknowledgement cursor carried by an ack or
    /// data segment: advances `unack_seq`, purges the retransmission
    /// buffer, and feeds the congestion and round-trip estimators.
    pub(crate) fn handle_ack(&self, segment: &Segment) {
        let Some(unack) = segment.unack() else {
            return;
        };

        let mut current = self.unack_seq.load(Ordering::Relaxed);
        while unack > current {
            match self.unack_seq.compare_exchange(
                current,
                unack,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut acked = 0usize;
        let mut newest: Option<Segment> = None;
        while let Some(covered) = self.send_buf.delete_min_if(|s| s.seq() < unack) {
            acked += 1;
            newest = Some(covered);
        }
        if acked > 0 {
            self.cubic.on_ack(acked);
            if let Some(sample) = newest {
                // Only a segment acknowledged on its first transmission
                // gives a clean round-trip sample.
                if sample.tx_count == 1 {
                    if let Some(sent_at) = sample.last_tx {
                        self.rtt.record(sent_at.elapsed());
                    }
                }
            }
        }
    }

    /// Enqueues a pure acknowledgement if the cursor has not gone out
    /// recently. Pure acks do not consume a sequence number and are never
    /// retransmitted.
    async fn maybe_send_ack(&self) -> Result<(), SessionError> {
        let delay = self.rtt.max_ack_delay();
        {
            let mut last = self.last_ack_tx.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < delay {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        let ack = Segment::ack(
            self.role.ack_kind(),
            self.id,
            self.next_seq.load(Ordering::Relaxed),
            self.next_recv.load(Ordering::Relaxed),
            self.recv_buf.remaining() as u16,
        );
        self.enqueue(ack).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{Role, Session, SessionConfig, SessionState};
    use super::*;
    use std::sync::atomic::Ordering;

    fn data(seq: u32, body: &[u8]) -> Segment {
        Segment::data(
            ProtocolKind::DataServerToClient,
            77,
            seq,
            0,
            0,
            0,
            Message::new(body.to_vec()),
        )
    }

    fn queued_seqs(session: &Session) -> Vec<u32> {
        std::iter::from_fn(|| session.recv_queue.delete_min())
            .map(|s| s.seq())
            .collect()
    }

    #[tokio::test]
    async fn rejects_tags_invalid_for_role() {
        let session = attached_client(MockUnderlay::reliable());
        let wrong_way = Segment::data(
            ProtocolKind::DataClientToServer,
            77,
            0,
            0,
            0,
            0,
            Message::new(b"x"),
        );
        assert!(matches!(
            session.handle_inbound(wrong_way).await,
            Err(SessionError::InvalidProtocol(
                ProtocolKind::DataClientToServer
            ))
        ));
        assert!(session.recv_queue.is_empty());
    }

    #[tokio::test]
    async fn reliable_data_goes_straight_to_the_receive_queue() {
        let session = attached_client(MockUnderlay::reliable());
        session.handle_inbound(data(0, b"a")).await.unwrap();
        session.handle_inbound(data(1, b"b")).await.unwrap();
        assert_eq!(queued_seqs(&session), [0, 1]);
        assert!(session.recv_buf.is_empty());
    }

    #[tokio::test]
    async fn reliable_transport_ignores_acks() {
        let session = attached_client(MockUnderlay::reliable());
        session
            .send_buf
            .insert(Segment::data(
                ProtocolKind::DataClientToServer,
                77,
                0,
                0,
                0,
                0,
                Message::new(b"x"),
            ))
            .await
            .unwrap();
        let ack = Segment::ack(ProtocolKind::AckServerToClient, 77, 0, 5, 100);
        session.handle_inbound(ack).await.unwrap();
        assert_eq!(session.send_buf.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_segments_are_delivered_in_order() {
        // Sequence 0 arrives first, then 3, 1, 2 in that order; the reader
        // sees 0, 1, 2, 3 and the next expected sequence ends at 4.
        let session = attached_client(MockUnderlay::unreliable());
        session.handle_inbound(data(0, b"a")).await.unwrap();
        for seq in [3u32, 1, 2] {
            session.handle_inbound(data(seq, b"x")).await.unwrap();
        }
        assert_eq!(queued_seqs(&session), [0, 1, 2, 3]);
        assert_eq!(session.next_recv.load(Ordering::Relaxed), 4);
        assert!(session.recv_buf.is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        // Two copies of sequence 0: exactly one delivery, the second copy
        // is dropped whether it arrives before or after the lift.
        let session = attached_client(MockUnderlay::unreliable());
        session.handle_inbound(data(0, b"a")).await.unwrap();
        session.handle_inbound(data(0, b"a")).await.unwrap();
        assert_eq!(queued_seqs(&session), [0]);
        assert_eq!(session.next_recv.load(Ordering::Relaxed), 1);

        // A duplicate buffered alongside the original is discarded by the
        // ordered lift rather than delivered twice.
        session.recv_buf.insert(data(1, b"b")).await.unwrap();
        session.handle_inbound(data(1, b"b")).await.unwrap();
        assert_eq!(queued_seqs(&session), [1]);
        assert_eq!(session.next_recv.load(Ordering::Relaxed), 2);
        assert!(session.recv_buf.is_empty());
    }

    #[tokio::test]
    async fn ack_purges_acknowledged_segments() {
        // After an ack with cursor 3, sequences 0..2 are gone from the
        // retransmission buffer and 3..4 remain.
        let session = attached_client(MockUnderlay::unreliable());
        for seq in 0..5u32 {
            session
                .send_buf
                .insert(Segment::data(
                    ProtocolKind::DataClientToServer,
                    77,
                    seq,
                    0,
                    0,
                    0,
                    Message::new(b"x"),
                ))
                .await
                .unwrap();
        }
        let ack = Segment::ack(ProtocolKind::AckServerToClient, 77, 0, 3, 100);
        session.handle_inbound(ack).await.unwrap();

        let left: Vec<u32> = std::iter::from_fn(|| session.send_buf.delete_min())
            .map(|s| s.seq())
            .collect();
        assert_eq!(left, [3, 4]);
        assert_eq!(session.unack_seq.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn data_segments_carry_acknowledgement() {
        let session = attached_client(MockUnderlay::unreliable());
        session
            .send_buf
            .insert(Segment::data(
                ProtocolKind::DataClientToServer,
                77,
                0,
                0,
                0,
                0,
                Message::new(b"x"),
            ))
            .await
            .unwrap();
        let piggyback = Segment::data(
            ProtocolKind::DataServerToClient,
            77,
            0,
            1, // acknowledges our sequence 0
            0,
            0,
            Message::new(b"y"),
        );
        session.handle_inbound(piggyback).await.unwrap();
        assert!(session.send_buf.is_empty());
    }

    #[tokio::test]
    async fn receiving_data_enqueues_a_pure_ack() {
        let session = attached_client(MockUnderlay::unreliable());
        session.handle_inbound(data(0, b"a")).await.unwrap();

        let ack = session.send_queue.delete_min().expect("ack enqueued");
        assert_eq!(ack.kind(), ProtocolKind::AckClientToServer);
        assert_eq!(ack.unack(), Some(1));

        // The cursor just went out; an immediate second delivery does not
        // generate another ack.
        session.handle_inbound(data(1, b"b")).await.unwrap();
        assert!(session.send_queue.delete_min().is_none());
    }

    #[tokio::test]
    async fn close_request_answers_and_finishes() {
        let underlay = MockUnderlay::reliable();
        let session = attached_server(underlay.clone());
        let request = Segment::control(
            ProtocolKind::CloseSessionRequest,
            77,
            0,
            StatusCode::Ok,
            Message::default(),
        );
        session.handle_inbound(request).await.unwrap();

        assert_eq!(
            underlay.written_kinds(),
            [ProtocolKind::CloseSessionResponse]
        );
        assert!(session.done.is_fired());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.recv_queue.is_closed());
    }

    #[tokio::test]
    async fn close_response_finishes_the_initiator() {
        let session = attached_client(MockUnderlay::reliable());
        let response = Segment::control(
            ProtocolKind::CloseSessionResponse,
            77,
            0,
            StatusCode::Ok,
            Message::default(),
        );
        session.handle_inbound(response).await.unwrap();
        assert!(session.done.is_fired());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn first_transmission_ack_records_a_round_trip() {
        let session = attached_client(MockUnderlay::unreliable());
        let mut segment = Segment::data(
            ProtocolKind::DataClientToServer,
            77,
            0,
            0,
            0,
            0,
            Message::new(b"x"),
        );
        segment.tx_count = 1;
        segment.last_tx = Some(Instant::now());
        session.send_buf.insert(segment).await.unwrap();

        let ack = Segment::ack(ProtocolKind::AckServerToClient, 77, 0, 1, 100);
        session.handle_ack(&ack);
        // The pre-sample timeout is 1.5s; a recorded sample pulls it down.
        assert!(session.rtt.rto() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn input_loop_survives_invalid_segments() {
        let underlay = MockUnderlay::reliable();
        let session = std::sync::Arc::new({
            let session = Session::new(77, Role::Client, SessionConfig::default());
            session.attach(underlay).unwrap();
            session
        });
        let cancel = CancellationToken::new();
        session.start(cancel.clone());

        let sender = session.inbound_sender();
        // A server-only tag first, then a good segment: the good one still
        // gets through.
        sender
            .send(Segment::data(
                ProtocolKind::DataClientToServer,
                77,
                0,
                0,
                0,
                0,
                Message::new(b"bad"),
            ))
            .await
            .unwrap();
        sender.send(data(0, b"good")).await.unwrap();

        let mut buf = [0u8; 8];
        let count = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            session.read(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..count], b"good");
        cancel.cancel();
    }
}
