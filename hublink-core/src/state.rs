//! Connection lifecycle state machine.
//!
//! A [`StateMachine`] holds the one authoritative [`ConnectionState`] of a
//! helper instance. Every change goes through [`StateMachine::set`] or
//! [`StateMachine::transition`], both of which validate the move against the
//! transition table. An illegal move is a programming error and panics.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, error};

use crate::error::StateError;

/// Lifecycle state of a managed MQTT connection.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub enum ConnectionState {
    /// No configuration has been supplied yet.
    #[default]
    Uninitialized = 0,
    /// Configured and idle; a connection may be started.
    Disconnected = 1,
    /// Transport is up and CONNECT was sent; waiting for CONNACK.
    Connecting = 2,
    /// Transport-only connection. Kept for completeness of the state space,
    /// no public operation enters it.
    TransportConnected = 3,
    /// CONNACK accepted, the session is usable.
    Connected = 4,
    /// A disconnect was requested and the worker is winding down.
    Disconnecting = 5,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 6] = [
        ConnectionState::Uninitialized,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::TransportConnected,
        ConnectionState::Connected,
        ConnectionState::Disconnecting,
    ];

    /// Returns a short, human-readable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::TransportConnected => "transport-connected",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same state is not a transition and is handled by the
    /// callers as a no-op.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Uninitialized, Disconnected)
                | (Disconnected, Connecting | Uninitialized)
                | (Connecting, Connected | Disconnected)
                | (TransportConnected, Connecting | Disconnected)
                | (Connected, Disconnecting | Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    /// Returns `self` as a one-element static slice, for error reporting.
    pub fn as_slice(self) -> &'static [ConnectionState] {
        match self {
            ConnectionState::Uninitialized => &[ConnectionState::Uninitialized],
            ConnectionState::Disconnected => &[ConnectionState::Disconnected],
            ConnectionState::Connecting => &[ConnectionState::Connecting],
            ConnectionState::TransportConnected => &[ConnectionState::TransportConnected],
            ConnectionState::Connected => &[ConnectionState::Connected],
            ConnectionState::Disconnecting => &[ConnectionState::Disconnecting],
        }
    }

    fn from_raw(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Uninitialized,
            1 => ConnectionState::Disconnected,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::TransportConnected,
            4 => ConnectionState::Connected,
            5 => ConnectionState::Disconnecting,
            _ => unreachable!("state cell only ever holds valid discriminants"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Validated holder of a [`ConnectionState`].
///
/// The state is kept in an atomic so that the caller-facing API and the
/// background worker can both observe it without a lock.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: AtomicU8,
}

impl StateMachine {
    /// Create a state machine in [`ConnectionState::Uninitialized`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Returns true if the current state is `state`.
    pub fn verify(&self, state: ConnectionState) -> bool {
        self.get() == state
    }

    /// Check that the current state is one of `required`.
    pub fn require(&self, required: &'static [ConnectionState]) -> Result<(), StateError> {
        let current = self.get();

        if required.contains(&current) {
            return Ok(());
        }

        debug!(
            "Library is in the wrong state ({}), one of {:?} required",
            current, required
        );

        Err(StateError { current, required })
    }

    /// Move to `next`, whatever the current state is.
    ///
    /// Setting the current state again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the move is not in the transition table.
    pub fn set(&self, next: ConnectionState) {
        let mut current = self.get();

        loop {
            if current == next {
                debug!("Skipping transition to the same state ({})", current);
                return;
            }

            assert_legal(current, next);

            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(raw) => current = ConnectionState::from_raw(raw),
            }
        }

        debug!("State transition: {} --> {}", current, next);
    }

    /// Move from `from` to `next` only if the current state is `from`.
    ///
    /// The check and the store happen atomically, so a concurrent change
    /// made by the worker can never be overwritten.
    ///
    /// # Panics
    ///
    /// Panics if `from --> next` is not in the transition table.
    pub fn transition(&self, from: ConnectionState, next: ConnectionState) -> Result<(), StateError> {
        assert_legal(from, next);

        self.state
            .compare_exchange(from as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|raw| {
                let current = ConnectionState::from_raw(raw);
                debug!(
                    "Library is in the wrong state ({}), {} required",
                    current, from
                );
                StateError {
                    current,
                    required: from.as_slice(),
                }
            })?;

        debug!("State transition: {} --> {}", from, next);

        Ok(())
    }
}

fn assert_legal(current: ConnectionState, next: ConnectionState) {
    if !current.can_transition_to(next) {
        error!("Invalid state transition, {} --> {}", current, next);
        panic!("Illegal state transition: {} --> {}", current, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use ConnectionState::*;

    fn machine_in(state: ConnectionState) -> StateMachine {
        let machine = StateMachine::new();
        machine.state.store(state as u8, Ordering::Release);
        machine
    }

    fn legal_targets(from: ConnectionState) -> &'static [ConnectionState] {
        match from {
            Uninitialized => &[Disconnected],
            Disconnected => &[Connecting, Uninitialized],
            Connecting => &[Connected, Disconnected],
            TransportConnected => &[Connecting, Disconnected],
            Connected => &[Disconnecting, Disconnected],
            Disconnecting => &[Disconnected],
        }
    }

    #[test]
    fn test_new_machine_is_uninitialized() {
        assert_eq!(StateMachine::new().get(), Uninitialized);
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        for from in ConnectionState::ALL {
            for to in ConnectionState::ALL {
                if from == to {
                    continue;
                }

                let machine = machine_in(from);
                let result = catch_unwind(AssertUnwindSafe(|| machine.set(to)));
                let legal = legal_targets(from).contains(&to);

                assert_eq!(result.is_ok(), legal, "{} --> {}", from, to);
                assert_eq!(from.can_transition_to(to), legal);

                if legal {
                    assert_eq!(machine.get(), to);
                }
            }
        }
    }

    #[test]
    fn test_same_state_is_noop() {
        for state in ConnectionState::ALL {
            let machine = machine_in(state);
            machine.set(state);
            assert_eq!(machine.get(), state);
        }
    }

    #[test]
    #[should_panic(expected = "Illegal state transition")]
    fn test_illegal_transition_panics() {
        let machine = StateMachine::new();
        machine.set(Connected);
    }

    #[test]
    fn test_require() {
        let machine = machine_in(Disconnected);
        assert!(machine.require(&[Disconnected]).is_ok());
        assert!(machine.require(&[Uninitialized, Disconnected]).is_ok());

        let err = machine.require(&[Connected]).unwrap_err();
        assert_eq!(err.current, Disconnected);
        assert_eq!(err.required, &[Connected]);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let machine = machine_in(Connected);
        machine.transition(Connected, Disconnecting).unwrap();
        assert_eq!(machine.get(), Disconnecting);

        let err = machine.transition(Connected, Disconnecting).unwrap_err();
        assert_eq!(err.current, Disconnecting);
        assert_eq!(machine.get(), Disconnecting);
    }

    #[test]
    #[should_panic(expected = "Illegal state transition")]
    fn test_transition_rejects_illegal_pair() {
        let machine = machine_in(Disconnected);
        let _ = machine.transition(Disconnected, Connected);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Connecting), "connecting");
        assert_eq!(format!("{}", TransportConnected), "transport-connected");
    }
}
