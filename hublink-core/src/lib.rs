pub mod error;
pub mod state;

pub use error::StateError;
pub use state::{ConnectionState, StateMachine};

/// A specialized `Result` type for state checks.
pub type Result<T> = std::result::Result<T, crate::error::StateError>;
