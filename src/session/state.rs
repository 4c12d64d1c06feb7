//! The session lifecycle state machine.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle states of a session, in the order they are passed through.
///
/// ```text
/// Init -> Attached -> Opening -> Established -> Closing -> Closed
///                        (server sessions skip Opening)
/// ```
///
/// State only ever advances. Read and write are refused before `Attached`
/// and after `Closing`; a server session jumps from `Attached` straight to
/// `Established` when it answers the open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created but not yet bound to an underlay.
    Init = 0,
    /// Bound to an underlay and usable by the application.
    Attached = 1,
    /// A client that has sent its open request and awaits the response.
    Opening = 2,
    /// The open handshake has completed; the normal data-transfer state.
    Established = 3,
    /// A close request is in flight.
    Closing = 4,
    /// The session is finished; all operations fail.
    Closed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Init,
            1 => SessionState::Attached,
            2 => SessionState::Opening,
            3 => SessionState::Established,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            other => unreachable!("invalid session state {other}"),
        }
    }
}

/// A session state that can only move forward.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Init as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Advances the state to `target`. Forwarding to the current state is
    /// a no-op; asking for an earlier state is a bug and panics. Returns
    /// whether this call performed the transition.
    pub fn forward_to(&self, target: SessionState) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if (target as u8) < current {
                panic!(
                    "session state cannot move backward: {:?} -> {target:?}",
                    SessionState::from_u8(current)
                );
            }
            if target as u8 == current {
                return false;
            }
            match self.0.compare_exchange(
                current,
                target as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
