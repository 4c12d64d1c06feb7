//! The outbound half of the session: draining the send path.
//!
//! Over a reliable underlay the loop is a plain drain: every segment goes
//! out once, in order, and the transport takes care of the rest. Over an
//! unreliable underlay the loop runs the full retransmission pipeline
//! each tick: trim what the peer has acknowledged, refill the
//! retransmission buffer up to the congestion window, and put everything
//! due on the wire, repeating segments whose timeout has expired.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::underlay::{SharedUnderlay, TransportProtocol};

use super::{Session, SessionError, SEGMENT_POLL_INTERVAL};

impl Session {
    /// Runs the output loop until cancellation, session completion, or a
    /// fatal transport error. A transport error terminates the session.
    pub(crate) async fn run_output_loop(&self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.done.fired() => return,
            _ = self.ready.fired() => {}
        }

        if let Err(err) = self.drive_output(&cancel).await {
            if !self.done.is_fired() {
                tracing::error!(session = self.id, %err, "output pipeline failed");
            }
            self.terminate();
        }
    }

    async fn drive_output(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let underlay = self.underlay()?;
        let transport = underlay.transport_protocol();
        if transport == TransportProtocol::ReliableStream {
            self.output_reliable(cancel, &underlay).await
        } else if transport == TransportProtocol::UnreliableDatagram {
            self.output_unreliable(cancel, &underlay).await
        } else {
            Err(SessionError::UnsupportedTransport)
        }
    }

    /// Writes segments to an underlay that already guarantees order and
    /// delivery, sleeping for the poll interval whenever the send queue is
    /// momentarily empty.
    async fn output_reliable(
        &self,
        cancel: &CancellationToken,
        underlay: &SharedUnderlay,
    ) -> Result<(), SessionError> {
        loop {
            if cancel.is_cancelled() || self.done.is_fired() {
                return Ok(());
            }
            match self.send_queue.delete_min() {
                Some(segment) => underlay.write_segment(&segment).await?,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.done.fired() => return Ok(()),
                        _ = tokio::time::sleep(SEGMENT_POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    /// Runs the retransmission pipeline against a lossy underlay.
    async fn output_unreliable(
        &self,
        cancel: &CancellationToken,
        underlay: &SharedUnderlay,
    ) -> Result<(), SessionError> {
        loop {
            if cancel.is_cancelled() || self.done.is_fired() {
                return Ok(());
            }
            self.output_tick(underlay).await?;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.done.fired() => return Ok(()),
                _ = tokio::time::sleep(SEGMENT_POLL_INTERVAL) => {}
            }
        }
    }

    /// One pass of the unreliable pipeline: trim, refill, flush.
    pub(crate) async fn output_tick(&self, underlay: &SharedUnderlay) -> Result<(), SessionError> {
        // Trim everything the peer has acknowledged. The input pipeline
        // purges on every ack as well; this sweep catches a cursor that
        // advanced between ticks.
        let acked_to = self.unack_seq.load(Ordering::Relaxed);
        while self
            .send_buf
            .delete_min_if(|segment| segment.seq() < acked_to)
            .is_some()
        {}

        // Refill the retransmission buffer up to the congestion window.
        // Pure acks never occupy the buffer; they go out immediately.
        let window = self.cubic.window();
        while self.send_buf.len() < window {
            let Some(segment) = self.send_queue.delete_min() else {
                break;
            };
            if segment.kind().is_ack() {
                underlay.write_segment(&segment).await?;
            } else {
                self.send_buf
                    .insert(segment)
                    .await
                    .map_err(|_| SessionError::ClosedPipe)?;
            }
        }

        // Put everything due on the wire. Anything going out for a second
        // or later time was lost once, which the window must hear about.
        let due = self.send_buf.collect_due(self.rtt.rto());
        if due.iter().any(|segment| segment.tx_count > 1) {
            self.cubic.on_loss();
        }
        for segment in &due {
            if segment.tx_count > 1 {
                tracing::trace!(
                    session = self.id,
                    seq = segment.seq(),
                    attempt = segment.tx_count,
                    "retransmitting segment"
                );
            }
            underlay.write_segment(segment).await?;
        }
        if !due.is_empty() {
            self.note_cursor_carried();
        }
        Ok(())
    }
}
