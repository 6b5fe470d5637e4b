use thiserror::Error;

use crate::state::ConnectionState;

/// An operation was attempted in a state that does not permit it.
///
/// This is a caller error, not a fault: the operation had no side effects and
/// may be retried once the connection reaches one of the `required` states.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("wrong state ({current}), one of {required:?} required")]
pub struct StateError {
    pub current: ConnectionState,
    pub required: &'static [ConnectionState],
}
